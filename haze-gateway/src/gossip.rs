#![forbid(unsafe_code)]

//! Gossip wiring for the orchestrator: channel registration, the shared
//! verify-by-round-topology check, and the apply handlers for both channels.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use haze_core::ephemeral::EphemeralId;
use haze_core::id::{Id, IdKind, DUMMY_USER};
use haze_core::{HazeError, HazeResult};
use haze_crypto::signature;
use haze_gossip::{
    GossipMessage, Manager, ManagerFlags, ProtocolFlags, RoundIdsPayload, BLOOM_FILTER_TAG,
    RATE_LIMIT_TAG,
};

use crate::comms::CommsGossipTransport;
use crate::instance::Instance;

const ERROR_DELIMITER: &str = "; ";

fn gated<F>(weak: Weak<Instance>, f: F) -> impl Fn(&GossipMessage) -> HazeResult<()>
where
    F: Fn(&Instance, &GossipMessage) -> HazeResult<()>,
{
    move |msg| {
        let instance = weak
            .upgrade()
            .ok_or_else(|| HazeError::Internal("gateway shutting down".into()))?;
        f(instance.as_ref(), msg)
    }
}

impl Instance {
    /// Register both gossip channels and hand the manager to the instance.
    /// No-op when gossip is disabled by configuration.
    pub fn init_gossip(self: &Arc<Self>, flags: ManagerFlags) {
        if self.config().disable_gossip {
            info!("gossip disabled by configuration");
            return;
        }

        let transport = Arc::new(CommsGossipTransport {
            comms: Arc::clone(self.comms()),
            hosts: self.hosts().clone(),
        });
        let manager = Arc::new(Manager::new(
            flags,
            self.id(),
            Arc::clone(self.private_key()),
            transport,
        ));

        let verify = Arc::new(gated(Arc::downgrade(self), Instance::gossip_verify));

        manager.new_gossip(
            RATE_LIMIT_TAG,
            ProtocolFlags::default(),
            verify.clone(),
            Arc::new(gated(
                Arc::downgrade(self),
                Instance::gossip_rate_limit_receive,
            )),
        );
        manager.new_gossip(
            BLOOM_FILTER_TAG,
            ProtocolFlags::default(),
            verify,
            Arc::new(gated(Arc::downgrade(self), Instance::gossip_bloom_receive)),
        );

        self.set_gossip(manager);
    }

    /// Shared inbound check: the origin must be a gateway whose node-kind
    /// twin sits in the topology of the round it is gossiping about, and the
    /// envelope signature must verify against its published key.
    pub(crate) fn gossip_verify(&self, msg: &GossipMessage) -> HazeResult<()> {
        debug!(origin = %msg.origin, "verifying gossip message");
        if msg.origin.kind() != IdKind::Gateway {
            return Err(HazeError::Unauthenticated(
                "gossip origin is not a gateway".into(),
            ));
        }

        let payload = RoundIdsPayload::decode(&msg.payload)
            .map_err(|e| HazeError::Invalid(format!("could not unmarshal gossip payload: {e}")))?;

        let round = self.storage().db().get_round(payload.round_id).map_err(|e| {
            HazeError::NotFound(format!(
                "did not recognize round sent out by gossip message: {e}"
            ))
        })?;

        let as_node = msg.origin.set_kind(IdKind::Node);
        if !round.topology_contains(&as_node) {
            return Err(HazeError::Unauthenticated(
                "origin gateway is not in round it's gossiping about".into(),
            ));
        }

        let public_key = self.ndf().gateway_public_key(&msg.origin)?;
        signature::verify(&public_key, &msg.signable(), &msg.signature)?;
        debug!(origin = %msg.origin, "verified gossip message");
        Ok(())
    }

    /// Apply a sender summary: one token per sender into the gossip-driven
    /// rate limiter.
    pub(crate) fn gossip_rate_limit_receive(&self, msg: &GossipMessage) -> HazeResult<()> {
        let payload = RoundIdsPayload::decode(&msg.payload)
            .map_err(|e| HazeError::Invalid(format!("could not unmarshal gossip payload: {e}")))?;
        info!(round = payload.round_id, "rate-limit gossip received");

        let errs = Mutex::new(Vec::new());
        for raw in &payload.ids {
            match Id::from_bytes(raw) {
                Ok(sender) => {
                    self.rate_limit().lookup_bucket(&sender.to_string()).add(1);
                }
                Err(e) => errs.lock().push(e.to_string()),
            }
        }

        let errs = errs.into_inner();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(HazeError::Internal(errs.join(ERROR_DELIMITER)))
        }
    }

    /// Apply a recipient summary: upsert a filter per recipient, then record
    /// the round as known. The whole application is one critical section.
    pub(crate) fn gossip_bloom_receive(&self, msg: &GossipMessage) -> HazeResult<()> {
        let _guard = self.bloom_gossip_lock.lock();

        let payload = RoundIdsPayload::decode(&msg.payload)
            .map_err(|e| HazeError::Invalid(format!("could not unmarshal gossip payload: {e}")))?;
        info!(round = payload.round_id, "bloom gossip received");

        let round = self.storage().db().get_round(payload.round_id)?;

        let errs = Mutex::new(Vec::new());
        for raw in &payload.ids {
            let result = EphemeralId::from_bytes(raw)
                .and_then(|recipient| self.upsert_filter(recipient, &round));
            if let Err(e) = result {
                errs.lock().push(e.to_string());
            }
        }

        self.record_known_round(payload.round_id);

        let errs = errs.into_inner();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(HazeError::Internal(errs.join(ERROR_DELIMITER)))
        }
    }

    /// Fan out the sender summary of an uploaded batch.
    pub(crate) async fn gossip_senders(&self, senders: Vec<Id>, round_id: u64) -> HazeResult<()> {
        let manager = self
            .gossip_manager()
            .ok_or_else(|| HazeError::Internal("gossip not initialized".into()))?;
        let protocol = manager
            .get(RATE_LIMIT_TAG)
            .ok_or_else(|| HazeError::Internal("unable to get gossip protocol".into()))?;

        let unique: HashSet<Id> = senders
            .into_iter()
            .filter(|sender| *sender != DUMMY_USER)
            .collect();
        let payload = RoundIdsPayload {
            round_id,
            ids: unique.into_iter().map(|id| id.to_vec()).collect(),
        };
        protocol.gossip(payload.encode()?).await?;
        Ok(())
    }

    /// Fan out the recipient summary of a completed round.
    pub(crate) async fn gossip_bloom(
        &self,
        recipients: &HashSet<EphemeralId>,
        round_id: u64,
    ) -> HazeResult<()> {
        let manager = self
            .gossip_manager()
            .ok_or_else(|| HazeError::Internal("gossip not initialized".into()))?;
        let protocol = manager
            .get(BLOOM_FILTER_TAG)
            .ok_or_else(|| HazeError::Internal("unable to get gossip protocol".into()))?;

        info!(round = round_id, "sending bloom gossip");
        let payload = RoundIdsPayload {
            round_id,
            ids: recipients.iter().map(|r| r.to_bytes().to_vec()).collect(),
        };
        protocol.gossip(payload.encode()?).await?;
        info!(round = round_id, "sent bloom gossip");
        Ok(())
    }
}
