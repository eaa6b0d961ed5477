#![forbid(unsafe_code)]

//! One gossip channel: a tag, a peer set, and signed fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rsa::RsaPrivateKey;
use tracing::debug;

use haze_core::id::Id;
use haze_core::{HazeError, HazeResult};
use haze_crypto::signature;

use crate::message::GossipMessage;

const ERROR_DELIMITER: &str = "; ";

#[derive(Debug, Clone, Copy)]
pub struct ProtocolFlags {
    /// Number of peers each outbound gossip is sent to.
    pub fanout: usize,
}

impl Default for ProtocolFlags {
    fn default() -> Self {
        ProtocolFlags { fanout: 3 }
    }
}

/// Outbound delivery of an envelope to one peer.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn send_gossip(&self, peer: &Id, msg: &GossipMessage) -> HazeResult<()>;
}

pub type VerifyFn = Arc<dyn Fn(&GossipMessage) -> HazeResult<()> + Send + Sync>;
pub type ReceiveFn = Arc<dyn Fn(&GossipMessage) -> HazeResult<()> + Send + Sync>;

pub struct Protocol {
    tag: String,
    flags: ProtocolFlags,
    origin: Id,
    signer: Arc<RsaPrivateKey>,
    transport: Arc<dyn GossipTransport>,
    peers: Mutex<Vec<Id>>,
    verify: VerifyFn,
    receive: ReceiveFn,
}

impl Protocol {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tag: String,
        flags: ProtocolFlags,
        origin: Id,
        signer: Arc<RsaPrivateKey>,
        transport: Arc<dyn GossipTransport>,
        verify: VerifyFn,
        receive: ReceiveFn,
    ) -> Self {
        Protocol {
            tag,
            flags,
            origin,
            signer,
            transport,
            peers: Mutex::new(Vec::new()),
            verify,
            receive,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn add_gossip_peer(&self, id: Id) -> HazeResult<()> {
        let mut peers = self.peers.lock();
        if peers.contains(&id) {
            return Err(HazeError::AlreadyExists(format!("peer {id}")));
        }
        peers.push(id);
        Ok(())
    }

    pub fn remove_gossip_peer(&self, id: &Id) -> HazeResult<()> {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|p| p != id);
        if peers.len() == before {
            return Err(HazeError::NotFound(format!("peer {id}")));
        }
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Build, sign, and fan out an envelope carrying `payload`. Succeeds when
    /// at least one peer accepted; otherwise returns the collected errors.
    pub async fn gossip(&self, payload: Vec<u8>) -> HazeResult<usize> {
        let mut msg = GossipMessage {
            tag: self.tag.clone(),
            origin: self.origin,
            payload,
            signature: Vec::new(),
        };
        msg.signature = signature::sign(&self.signer, &msg.signable())?;

        let targets: Vec<Id> = {
            let peers = self.peers.lock();
            peers
                .choose_multiple(&mut rand::thread_rng(), self.flags.fanout)
                .copied()
                .collect()
        };
        if targets.is_empty() {
            return Err(HazeError::Internal(format!(
                "no peers registered for {}",
                self.tag
            )));
        }

        let sends = targets
            .iter()
            .map(|peer| self.transport.send_gossip(peer, &msg));
        let mut accepted = 0usize;
        let mut errs = Vec::new();
        for (peer, result) in targets.iter().zip(join_all(sends).await) {
            match result {
                Ok(()) => accepted += 1,
                Err(e) => errs.push(format!("{peer}: {e}")),
            }
        }
        debug!(tag = %self.tag, accepted, failed = errs.len(), "gossip fan-out done");

        if accepted == 0 {
            return Err(HazeError::Internal(format!(
                "could not send to any peer: {}",
                errs.join(ERROR_DELIMITER)
            )));
        }
        Ok(accepted)
    }

    /// Verify then apply one inbound envelope.
    pub fn handle(&self, msg: &GossipMessage) -> HazeResult<()> {
        (self.verify)(msg)?;
        (self.receive)(msg)
    }
}
