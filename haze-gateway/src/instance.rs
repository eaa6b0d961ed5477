#![forbid(unsafe_code)]

//! The gateway orchestrator: owns the buffer, store, rate limiters, gossip
//! manager, and round-event waiter, and exposes the public RPC surface.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use haze_core::bloom::RoundFilter;
use haze_core::config::GatewayConfig;
use haze_core::ephemeral::{EphemeralId, EPHEMERAL_ID_LEN};
use haze_core::events::RoundEvents;
use haze_core::id::{Id, IdKind};
use haze_core::known_rounds::KnownRounds;
use haze_core::ratelimit::{BucketMap, MapParams};
use haze_core::rounds::{Round, RoundState};
use haze_core::{HazeError, HazeResult};
use haze_crypto::format::Message;
use haze_crypto::{hash, signature};
use haze_gossip::Manager;
use haze_storage::{ClientRound, Slot, Storage, UnmixedBuffer};

use crate::comms::{Comms, Host, HostTable};
use crate::junk;
use crate::ndf::NetworkDefinition;
use crate::rpc::{
    Batch, ClientKeyRequest, GatewaySlot, GatewaySlotResponse, GatewaySlots, GetMessages,
    GetMessagesResponse, HistoricalRounds, HistoricalRoundsResponse, MixedSlot, NotificationBatch,
    NotificationData, PayloadPair, SignedClientKeyRequest, SignedKeyResponse,
};

/// Timeout for every outbound RPC.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(1300);
/// How long `ProcessCompletedBatch` waits for round data.
const ROUND_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
/// Acceptable clock skew on a client key request.
const REQUEST_KEY_THRESHOLD: Duration = Duration::from_secs(3 * 60);
/// Bound on the peer add/remove signal channels.
const GW_CHAN_LEN: usize = 2;

/// Batch capacity used while a round's advertised size is still unknown.
const UNKNOWN_BATCH_SIZE: u32 = u32::MAX;

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

enum Route {
    Local,
    Forward(Host),
}

pub struct Instance {
    cfg: GatewayConfig,
    id: Id,
    private_key: Arc<RsaPrivateKey>,
    storage: Storage,
    unmixed: UnmixedBuffer,
    /// Sender credits learned via gossip.
    rate_limit: BucketMap,
    /// Admission buckets for `PutMessage`/`PutManyMessages`.
    message_rate_limit: BucketMap,
    comms: Arc<dyn Comms>,
    hosts: HostTable,
    server_host: Host,
    notification_host: Option<Host>,
    ndf: NetworkDefinition,
    gossip: OnceCell<Arc<Manager>>,
    round_events: RoundEvents,
    known_rounds: Mutex<KnownRounds>,
    known_rounds_path: PathBuf,
    /// Serializes inbound bloom handling: filter upserts and the
    /// known-rounds update form one critical section.
    pub(crate) bloom_gossip_lock: Mutex<()>,
    add_gateway_tx: mpsc::Sender<Id>,
    remove_gateway_tx: mpsc::Sender<Id>,
    peer_rx: Mutex<Option<(mpsc::Receiver<Id>, mpsc::Receiver<Id>)>>,
}

impl Instance {
    pub fn new(
        cfg: GatewayConfig,
        id: Id,
        private_key: Arc<RsaPrivateKey>,
        storage: Storage,
        comms: Arc<dyn Comms>,
        ndf: NetworkDefinition,
    ) -> Arc<Instance> {
        let rate_limit = BucketMap::new(cfg.rate_limit.map_params());
        // The admission limiter is deliberately tight: one message per leak
        // interval per sender unless the IP is whitelisted.
        let message_rate_limit = BucketMap::new(MapParams {
            capacity: 1,
            leaked_tokens: 1,
            leak_duration: Duration::from_secs(2),
            poll_duration: cfg.rate_limit.map_params().poll_duration,
            bucket_max_age: cfg.rate_limit.map_params().bucket_max_age,
        });
        for key in &cfg.rate_limit.whitelist {
            rate_limit.whitelist(key);
            message_rate_limit.whitelist(key);
        }

        let hosts = HostTable::new();
        for gw in &ndf.gateways {
            if gw.id != id {
                hosts.add(Host::new(gw.id, gw.address.clone()));
            }
        }
        let notification_host = ndf
            .notification
            .as_ref()
            .map(|n| Host::new(n.id, n.address.clone()));
        if let Some(host) = &notification_host {
            hosts.add(host.clone());
        }

        // The fronted mix server carries this gateway's identity retagged as
        // a node.
        let server_host = Host::new(id.set_kind(IdKind::Node), cfg.cmix_address.clone());

        let known_rounds_path = PathBuf::from(&cfg.known_rounds_path);
        let known_rounds = KnownRounds::load(&known_rounds_path).unwrap_or_else(|_| {
            info!("starting with a fresh known-rounds set");
            KnownRounds::new()
        });

        let (add_gateway_tx, add_rx) = mpsc::channel(GW_CHAN_LEN);
        let (remove_gateway_tx, remove_rx) = mpsc::channel(GW_CHAN_LEN);

        Arc::new(Instance {
            cfg,
            id,
            private_key,
            storage,
            unmixed: UnmixedBuffer::new(),
            rate_limit,
            message_rate_limit,
            comms,
            hosts,
            server_host,
            notification_host,
            ndf,
            gossip: OnceCell::new(),
            round_events: RoundEvents::new(),
            known_rounds: Mutex::new(known_rounds),
            known_rounds_path,
            bloom_gossip_lock: Mutex::new(()),
            add_gateway_tx,
            remove_gateway_tx,
            peer_rx: Mutex::new(Some((add_rx, remove_rx))),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.cfg
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn unmixed(&self) -> &UnmixedBuffer {
        &self.unmixed
    }

    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }

    pub fn ndf(&self) -> &NetworkDefinition {
        &self.ndf
    }

    pub fn rate_limit(&self) -> &BucketMap {
        &self.rate_limit
    }

    pub fn message_rate_limit(&self) -> &BucketMap {
        &self.message_rate_limit
    }

    pub fn round_events(&self) -> &RoundEvents {
        &self.round_events
    }

    pub fn private_key(&self) -> &Arc<RsaPrivateKey> {
        &self.private_key
    }

    pub fn comms(&self) -> &Arc<dyn Comms> {
        &self.comms
    }

    pub(crate) fn set_gossip(&self, manager: Arc<Manager>) {
        let _ = self.gossip.set(manager);
    }

    pub fn gossip_manager(&self) -> Option<&Arc<Manager>> {
        self.gossip.get()
    }

    pub fn known_rounds_checked(&self, round_id: u64) -> bool {
        self.known_rounds.lock().checked(round_id)
    }

    pub(crate) fn record_known_round(&self, round_id: u64) {
        let mut known = self.known_rounds.lock();
        known.check(round_id);
        if let Err(e) = known.save(&self.known_rounds_path) {
            error!("failed to store updated known rounds: {e}");
        }
    }

    /// Decide whether a request is ours or must be forwarded verbatim.
    fn route(&self, target: &Option<Id>) -> HazeResult<Route> {
        match target {
            None => Ok(Route::Local),
            Some(t) if *t == self.id => Ok(Route::Local),
            Some(t) => {
                let host = self
                    .hosts
                    .get(t)
                    .ok_or_else(|| HazeError::NoTarget(format!("unable to find target host {t}")))?;
                if !host.connected() {
                    return Err(HazeError::NotConnected(format!(
                        "unable to connect to target host {t}"
                    )));
                }
                Ok(Route::Forward(host))
            }
        }
    }

    async fn with_send_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = HazeResult<T>>,
    ) -> HazeResult<T> {
        match timeout(SEND_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(HazeError::Timeout(format!(
                "send exceeded {}ms",
                SEND_TIMEOUT.as_millis()
            ))),
        }
    }

    fn epoch_of(&self, round: &Round) -> u32 {
        let ts = round.timestamp(RoundState::Queued);
        (ts / self.cfg.epoch_duration_nanos()).max(0) as u32
    }

    /// Ingest a round update from the scheduling authority: persist it, wake
    /// waiters, and drive the batch upload once the round is queued.
    pub fn round_update(self: &Arc<Self>, round: Round) -> HazeResult<()> {
        self.storage.db().upsert_round(round.clone())?;
        self.round_events.publish(round.clone());
        if round.state == RoundState::Queued {
            let instance = Arc::clone(self);
            tokio::spawn(async move {
                instance.upload_unmixed_batch(&round).await;
            });
        }
        Ok(())
    }

    /// Client registration relay. The node's response is countersigned with
    /// this gateway's key so the client can verify it, and the relationship
    /// key is stored locally and scrubbed from the reply.
    pub async fn request_client_key(
        &self,
        msg: SignedClientKeyRequest,
    ) -> HazeResult<SignedKeyResponse> {
        if let Route::Forward(host) = self.route(&msg.target)? {
            return self
                .with_send_timeout(self.comms.send_request_client_key(&host, &msg))
                .await;
        }

        let request: ClientKeyRequest = serde_cbor::from_slice(&msg.client_key_request)
            .map_err(|e| HazeError::Invalid(format!("couldn't parse client key request: {e}")))?;

        let skew = (now_nanos() - request.request_timestamp).unsigned_abs();
        if skew > REQUEST_KEY_THRESHOLD.as_nanos() as u64 {
            return Err(HazeError::Invalid(
                "request timestamp is beyond acceptable threshold".into(),
            ));
        }

        info!("passing on client key request");
        let mut resp = self
            .with_send_timeout(self.comms.send_request_client_key(&self.server_host, &msg))
            .await?;

        // The client holds no node key material, so the gateway countersigns
        // the response blob.
        resp.key_response_signed_by_gateway =
            signature::sign(&self.private_key, &resp.key_response)?;

        let user_id = signature::user_id_from_key(&request.client_pubkey_der, &request.salt);
        let client = haze_storage::Client {
            id: user_id,
            key: std::mem::take(&mut resp.client_gateway_key),
        };
        // Known-bug boundary: a failed upsert still returns the signed
        // response; the client re-registers on its next send attempt.
        if let Err(e) = self.storage.db().upsert_client(client) {
            warn!("failed to store client {user_id}: {e}");
        }

        Ok(resp)
    }

    /// MAC check for one slot: the client must share a key with our server.
    fn process_put_message(&self, msg: &GatewaySlot) -> HazeResult<Id> {
        let sender_id = msg.message.sender_id;
        let client = self
            .storage
            .db()
            .get_client(&sender_id)
            .map_err(|_| {
                HazeError::Unauthenticated(
                    "did not recognize ID; have you registered successfully?".into(),
                )
            })?;

        let digest = hash::slot_digest(
            sender_id.as_bytes(),
            &msg.message.payload_a,
            &msg.message.payload_b,
            &msg.message.salt,
            &msg.message.kmacs,
            msg.round_id,
        );
        let expected = hash::client_mac(&client.key, &msg.message.salt, &digest);
        if expected != msg.message.mac {
            return Err(HazeError::Unauthenticated(
                "could not authenticate client; is the client registered with this node?".into(),
            ));
        }
        Ok(sender_id)
    }

    /// Reject unless the IP is whitelisted or the sender bucket accepts.
    fn check_admission(&self, sender_id: &Id, ip_addr: &str) -> HazeResult<()> {
        let ip_whitelisted = self.message_rate_limit.lookup_bucket(ip_addr).is_whitelisted();
        let id_accepted = self
            .message_rate_limit
            .lookup_bucket(&sender_id.to_string())
            .add(1);
        if !ip_whitelisted && !id_accepted {
            return Err(HazeError::RateLimited(format!(
                "too many messages from {sender_id} at {ip_addr} in a specific time frame"
            )));
        }
        Ok(())
    }

    fn batch_size_hint(&self, round_id: u64) -> u32 {
        match self.storage.db().get_round(round_id) {
            Ok(round) if round.batch_size > 0 => round.batch_size,
            _ => UNKNOWN_BATCH_SIZE,
        }
    }

    /// Add one message to the outgoing queue.
    pub async fn put_message(
        &self,
        msg: GatewaySlot,
        ip_addr: &str,
    ) -> HazeResult<GatewaySlotResponse> {
        if let Route::Forward(host) = self.route(&msg.target)? {
            return self
                .with_send_timeout(self.comms.send_put_message(&host, &msg))
                .await;
        }

        let sender_id = self.process_put_message(&msg)?;
        self.check_admission(&sender_id, ip_addr)?;

        let round_id = msg.round_id;
        self.unmixed
            .add_unmixed_message(msg.message, round_id, self.batch_size_hint(round_id))
            .map_err(|e| {
                HazeError::Overfull(format!("could not add to round {round_id}: {e}; please try a different round"))
            })?;
        debug!(round = round_id, sender = %sender_id, "queued message");

        Ok(GatewaySlotResponse {
            accepted: true,
            round_id,
        })
    }

    /// Add many messages to the outgoing queue, all bound for one round.
    pub async fn put_many_messages(
        &self,
        msgs: GatewaySlots,
        ip_addr: &str,
    ) -> HazeResult<GatewaySlotResponse> {
        if msgs.messages.is_empty() {
            return Err(HazeError::Invalid("malformed message object received".into()));
        }
        if let Route::Forward(host) = self.route(&msgs.target)? {
            return self
                .with_send_timeout(self.comms.send_put_many_messages(&host, &msgs))
                .await;
        }

        let mut sender_id = None;
        for msg in &msgs.messages {
            let id = self.process_put_message(msg)?;
            sender_id.get_or_insert(id);
        }
        let sender_id = sender_id.ok_or_else(|| HazeError::Internal("empty batch".into()))?;
        self.check_admission(&sender_id, ip_addr)?;

        let round_id = msgs.round_id;
        let slots: Vec<Slot> = msgs.messages.into_iter().map(|m| m.message).collect();
        self.unmixed
            .add_many_unmixed_messages(slots, round_id, self.batch_size_hint(round_id))
            .map_err(|e| {
                HazeError::Overfull(format!("could not add to round {round_id}: {e}; please try a different round"))
            })?;

        Ok(GatewaySlotResponse {
            accepted: true,
            round_id,
        })
    }

    /// Look up messages by ephemeral recipient and round.
    pub async fn request_messages(&self, req: GetMessages) -> HazeResult<GetMessagesResponse> {
        if req.client_id.len() != EPHEMERAL_ID_LEN || req.round_id == 0 {
            return Err(HazeError::Invalid(
                "could not parse message; please try again with a properly crafted message".into(),
            ));
        }
        if let Route::Forward(host) = self.route(&req.target)? {
            return self
                .with_send_timeout(self.comms.send_request_messages(&host, &req))
                .await;
        }

        let recipient = EphemeralId::from_bytes(&req.client_id)?;
        let (msgs, has_round) = self.storage.get_mixed_messages(recipient, req.round_id)?;
        if !has_round {
            debug!(round = req.round_id, "requested round is not recorded here");
        }

        let messages = msgs
            .iter()
            .map(|m| {
                let (payload_a, payload_b) = m.message_contents();
                PayloadPair {
                    payload_a: payload_a.to_vec(),
                    payload_b: payload_b.to_vec(),
                }
            })
            .collect();
        Ok(GetMessagesResponse {
            messages,
            has_round,
        })
    }

    /// Best-effort lookup of requested rounds.
    pub async fn request_historical_rounds(
        &self,
        req: HistoricalRounds,
    ) -> HazeResult<HistoricalRoundsResponse> {
        if req.rounds.is_empty() {
            return Err(HazeError::Invalid(
                "invalid historical round request; please send a valid message".into(),
            ));
        }
        if let Route::Forward(host) = self.route(&req.target)? {
            return self
                .with_send_timeout(self.comms.send_request_historical_rounds(&host, &req))
                .await;
        }

        let rounds = match self.storage.db().get_rounds(&req.rounds) {
            Ok(rounds) => rounds,
            Err(HazeError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(HistoricalRoundsResponse { rounds })
    }

    /// Ship the buffered batch for a round to the server, padded with junk
    /// slots up to the advertised batch size.
    pub async fn upload_unmixed_batch(self: &Arc<Self>, round_info: &Round) {
        if round_info.batch_size == 0 {
            warn!(round = round_info.id, "server sent empty batch size");
            return;
        }

        let Some(mut batch) = self.unmixed.pop_round(round_info.id) else {
            error!(round = round_info.id, "batch not found");
            return;
        };

        info!(
            round = round_info.id,
            messages = batch.slots.len(),
            "sending batch"
        );

        let num_nodes = round_info.topology.len();
        if num_nodes == 0 {
            error!(round = round_info.id, "round topology empty, sending bad messages");
        }

        let senders: Vec<Id> = batch.slots.iter().map(|s| s.sender_id).collect();

        for i in batch.slots.len() as u64..u64::from(round_info.batch_size) {
            batch.slots.push(junk::gen_junk_msg(
                self.ndf.payload_len,
                num_nodes,
                i as u32,
                round_info.id,
            ));
        }

        let upload = Batch {
            round: round_info.clone(),
            from_phase: batch.from_phase,
            slots: batch.slots,
        };
        match self
            .with_send_timeout(self.comms.upload_unmixed_batch(&self.server_host, &upload))
            .await
        {
            Ok(()) => info!(round = round_info.id, "upload complete"),
            Err(e) => warn!(round = round_info.id, "error streaming unmixed batch: {e}"),
        }

        if !self.cfg.disable_gossip {
            let instance = Arc::clone(self);
            let round_id = round_info.id;
            tokio::spawn(async move {
                if let Err(e) = instance.gossip_senders(senders, round_id).await {
                    warn!(round = round_id, "unable to gossip batch senders: {e}");
                }
            });
        }
    }

    /// Handle one round's mixed output: demultiplex by ephemeral recipient,
    /// persist, then fan out bloom gossip and notifications.
    pub async fn process_completed_batch(
        self: &Arc<Self>,
        slots: Vec<MixedSlot>,
        round_id: u64,
    ) -> HazeResult<()> {
        if slots.is_empty() {
            return Ok(());
        }

        let mut round = self.storage.db().get_round(round_id).ok();
        if round
            .as_ref()
            .map_or(true, |r| r.state < RoundState::Queued)
        {
            warn!(
                round = round_id,
                "round data missing or early, waiting up to {:?}", ROUND_LOOKUP_TIMEOUT
            );
            let (info, timed_out) = self
                .round_events
                .wait_for_round(
                    round_id,
                    &[RoundState::Queued, RoundState::Realtime, RoundState::Completed],
                    ROUND_LOOKUP_TIMEOUT,
                )
                .await;
            if timed_out || info.is_none() {
                return Err(HazeError::Timeout(format!(
                    "failed to get round {round_id} after {ROUND_LOOKUP_TIMEOUT:?} wait, cannot process batch"
                )));
            }
            round = info;
        }
        let round = round.ok_or_else(|| HazeError::NotFound(format!("round {round_id}")))?;

        let (recipients, client_round, notifications) =
            self.process_messages(&slots, round_id, &round);

        // A storage failure is logged but does not stop the gossip below;
        // peers still learn the round happened.
        if let Err(e) = self.storage.db().insert_mixed_messages(&client_round) {
            error!(round = round_id, "inserting new mixed messages failed: {e}");
        }

        if !self.cfg.disable_gossip {
            let instance = Arc::clone(self);
            let gossip_recipients = recipients.clone();
            tokio::spawn(async move {
                if let Err(e) = instance.gossip_bloom(&gossip_recipients, round_id).await {
                    error!(round = round_id, "unable to gossip bloom information: {e}");
                }
            });

            let instance = Arc::clone(self);
            let local_recipients = recipients;
            tokio::spawn(async move {
                if let Err(e) = instance.upsert_filters(&local_recipients, round_id) {
                    error!(round = round_id, "unable to update local bloom filters: {e}");
                }
            });
        }

        match &self.notification_host {
            Some(host) => {
                let host = host.clone();
                let comms = Arc::clone(&self.comms);
                tokio::spawn(async move {
                    match timeout(SEND_TIMEOUT, comms.send_notification_batch(&host, &notifications))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("unable to send notification data: {e}"),
                        Err(_) => error!("notification send timed out"),
                    }
                });
            }
            None => {
                info!("notification bot not found in NDF, skipping notifications");
            }
        }

        Ok(())
    }

    /// Split a round's output into real messages and dummies, accumulating
    /// recipients, stored rows, and notification entries.
    fn process_messages(
        &self,
        slots: &[MixedSlot],
        round_id: u64,
        round: &Round,
    ) -> (HashSet<EphemeralId>, ClientRound, NotificationBatch) {
        let mut client_round = ClientRound {
            id: round_id,
            timestamp: round.timestamp(RoundState::Queued),
            messages: Vec::with_capacity(slots.len()),
        };
        let mut recipients = HashSet::new();
        let mut notifications = NotificationBatch {
            round_id,
            notifications: Vec::with_capacity(slots.len()),
        };

        let mut real = 0usize;
        for slot in slots {
            let msg = match Message::from_payloads(&slot.payload_a, &slot.payload_b) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("unable to reconstruct message: {e}");
                    continue;
                }
            };
            if msg.is_dummy() {
                continue;
            }

            let recipient = msg.ephemeral_rid().clear(round.address_space_size);
            if recipient.is_dummy() {
                continue;
            }
            recipients.insert(recipient);

            debug!(
                recipient = recipient.int64(),
                round = round_id,
                "message received"
            );
            client_round.messages.push(haze_storage::models::MixedMessage::new(
                round_id,
                recipient,
                &slot.payload_a,
                &slot.payload_b,
            ));
            real += 1;

            notifications.notifications.push(NotificationData {
                ephemeral_id: recipient.int64(),
                identity_fp: msg.identity_fp().to_vec(),
                message_hash: hash::message_hash(msg.contents()),
            });
        }

        info!(
            round = round_id,
            real,
            dummies = slots.len() - real,
            "round output processed"
        );
        (recipients, client_round, notifications)
    }

    /// Build and commit the bloom filter row for one recipient and round.
    pub fn upsert_filter(&self, recipient: EphemeralId, round: &Round) -> HazeResult<()> {
        let mut filter = RoundFilter::new();
        filter.add(round.id);
        self.storage.handle_bloom_filter(
            recipient,
            filter.as_bytes().to_vec(),
            round.id,
            self.epoch_of(round),
        )
    }

    /// Commit filters for every recipient of a round and record its epoch.
    pub fn upsert_filters(
        &self,
        recipients: &HashSet<EphemeralId>,
        round_id: u64,
    ) -> HazeResult<()> {
        let round = self.storage.db().get_round(round_id)?;
        self.storage
            .db()
            .insert_epoch(round_id, self.epoch_of(&round))?;
        for recipient in recipients {
            self.upsert_filter(*recipient, &round)?;
        }
        Ok(())
    }

    /// Queue a peer addition for the gossip protocols.
    pub fn signal_add_gateway(&self, id: Id) {
        if let Err(e) = self.add_gateway_tx.try_send(id) {
            warn!("add-gateway signal dropped: {e}");
        }
    }

    /// Queue a peer removal for the gossip protocols.
    pub fn signal_remove_gateway(&self, id: Id) {
        if let Err(e) = self.remove_gateway_tx.try_send(id) {
            warn!("remove-gateway signal dropped: {e}");
        }
    }

    /// Drain the peer signal channels into every protocol's peer set.
    pub fn start_peers_thread(self: &Arc<Self>) -> JoinHandle<()> {
        let (mut add_rx, mut remove_rx) = self
            .peer_rx
            .lock()
            .take()
            .expect("peers thread started twice");
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let manager = instance.gossip_manager().cloned();
                tokio::select! {
                    added = add_rx.recv() => {
                        let Some(id) = added else { return };
                        if let Some(manager) = &manager {
                            for tag in [haze_gossip::RATE_LIMIT_TAG, haze_gossip::BLOOM_FILTER_TAG] {
                                if let Some(protocol) = manager.get(tag) {
                                    if let Err(e) = protocol.add_gossip_peer(id) {
                                        debug!("add gossip peer {id}: {e}");
                                    }
                                }
                            }
                        }
                    }
                    removed = remove_rx.recv() => {
                        let Some(id) = removed else { return };
                        if let Some(manager) = &manager {
                            for tag in [haze_gossip::RATE_LIMIT_TAG, haze_gossip::BLOOM_FILTER_TAG] {
                                if let Some(protocol) = manager.get(tag) {
                                    if let Err(e) = protocol.remove_gossip_peer(&id) {
                                        debug!("remove gossip peer {id}: {e}");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Periodic store GC: drop filters and round messages past retention.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(instance.cfg.cleanup_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let retention = instance.cfg.retention_period().as_nanos() as i64;
                let threshold =
                    ((now_nanos() - retention) / instance.cfg.epoch_duration_nanos()).max(0) as u32;
                if let Err(e) = instance
                    .storage
                    .db()
                    .delete_client_filters_before_epoch(threshold)
                {
                    error!("filter cleanup failed: {e}");
                }
                match instance.storage.db().delete_epochs_before(threshold) {
                    Ok(rounds) => {
                        for round_id in rounds {
                            if let Err(e) =
                                instance.storage.db().delete_mixed_messages_by_round(round_id)
                            {
                                error!(round = round_id, "message cleanup failed: {e}");
                            }
                        }
                    }
                    Err(e) => error!("epoch cleanup failed: {e}"),
                }
            }
        })
    }
}
