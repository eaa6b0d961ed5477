//! End-to-end behavior of the orchestrator against the in-memory store and a
//! recording comms layer.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use haze_core::config::GatewayConfig;
use haze_core::ephemeral::EphemeralId;
use haze_core::id::{Id, IdKind};
use haze_core::rounds::{Round, RoundState, NUM_STATES};
use haze_core::{HazeError, HazeResult};
use haze_crypto::format::{Message, IDENTITY_FP_LEN};
use haze_crypto::{hash, signature};
use haze_gateway::comms::{Comms, Host};
use haze_gateway::instance::Instance;
use haze_gateway::ndf::{NdfGateway, NetworkDefinition};
use haze_gateway::rpc::{
    Batch, GatewaySlot, GatewaySlotResponse, GatewaySlots, GetMessages, GetMessagesResponse,
    HistoricalRounds, HistoricalRoundsResponse, MixedSlot, NotificationBatch,
    SignedClientKeyRequest, SignedKeyResponse,
};
use haze_gossip::{GossipMessage, ManagerFlags, RoundIdsPayload, BLOOM_FILTER_TAG};
use haze_storage::{Client, Slot, Storage};

#[derive(Default)]
struct MockComms {
    uploads: Mutex<Vec<Batch>>,
    forwarded_puts: Mutex<Vec<GatewaySlot>>,
    notifications: Mutex<Vec<NotificationBatch>>,
}

#[async_trait]
impl Comms for MockComms {
    async fn send_put_message(
        &self,
        _host: &Host,
        msg: &GatewaySlot,
    ) -> HazeResult<GatewaySlotResponse> {
        self.forwarded_puts.lock().push(msg.clone());
        Ok(GatewaySlotResponse {
            accepted: true,
            round_id: 777,
        })
    }

    async fn send_put_many_messages(
        &self,
        _host: &Host,
        _msgs: &GatewaySlots,
    ) -> HazeResult<GatewaySlotResponse> {
        Err(HazeError::Internal("unexpected proxy hop".into()))
    }

    async fn send_request_messages(
        &self,
        _host: &Host,
        _req: &GetMessages,
    ) -> HazeResult<GetMessagesResponse> {
        Err(HazeError::Internal("unexpected proxy hop".into()))
    }

    async fn send_request_historical_rounds(
        &self,
        _host: &Host,
        _req: &HistoricalRounds,
    ) -> HazeResult<HistoricalRoundsResponse> {
        Err(HazeError::Internal("unexpected proxy hop".into()))
    }

    async fn send_request_client_key(
        &self,
        _host: &Host,
        _req: &SignedClientKeyRequest,
    ) -> HazeResult<SignedKeyResponse> {
        // Stands in for the fronted node during registration.
        Ok(SignedKeyResponse {
            key_response: b"node-key-response".to_vec(),
            key_response_signed_by_gateway: Vec::new(),
            client_gateway_key: b"relationship-key".to_vec(),
        })
    }

    async fn upload_unmixed_batch(&self, _host: &Host, batch: &Batch) -> HazeResult<()> {
        self.uploads.lock().push(batch.clone());
        Ok(())
    }

    async fn send_notification_batch(
        &self,
        _host: &Host,
        batch: &NotificationBatch,
    ) -> HazeResult<()> {
        self.notifications.lock().push(batch.clone());
        Ok(())
    }

    async fn send_gossip(&self, _host: &Host, _msg: &GossipMessage) -> HazeResult<()> {
        Ok(())
    }
}

struct Harness {
    instance: Arc<Instance>,
    comms: Arc<MockComms>,
    _dir: tempfile::TempDir,
}

fn round(id: u64, update_id: u64, state: RoundState) -> Round {
    let mut timestamps = [0i64; NUM_STATES];
    timestamps[RoundState::Queued.as_index()] = 2 * 3600 * 1_000_000_000;
    Round {
        id,
        update_id,
        state,
        batch_size: 10,
        topology: vec![Id::from_label("node-a", IdKind::Node)],
        timestamps,
        address_space_size: 16,
        info_blob: Vec::new(),
    }
}

fn harness_with(ndf: NetworkDefinition, disable_gossip: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = GatewayConfig {
        dev_mode: true,
        disable_gossip,
        epoch_duration_secs: 3600,
        known_rounds_path: dir
            .path()
            .join("known_rounds.cbor")
            .to_string_lossy()
            .into_owned(),
        ..GatewayConfig::default()
    };
    let comms = Arc::new(MockComms::default());
    let instance = Instance::new(
        cfg,
        Id::from_label("self-gw", IdKind::Gateway),
        Arc::new(signature::generate_keypair().unwrap()),
        Storage::in_memory(),
        Arc::clone(&comms) as Arc<dyn Comms>,
        ndf,
    );
    Harness {
        instance,
        comms,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(NetworkDefinition::default(), true)
}

/// A client slot carrying a valid MAC for `key`.
fn authenticated_slot(sender_id: Id, key: &[u8], round_id: u64) -> GatewaySlot {
    let payload_a = vec![7u8; 64];
    let payload_b = vec![8u8; 64];
    let salt = vec![9u8; 32];
    let digest = hash::slot_digest(sender_id.as_bytes(), &payload_a, &payload_b, &salt, &[], round_id);
    let mac = hash::client_mac(key, &salt, &digest);
    GatewaySlot {
        message: Slot {
            sender_id,
            payload_a,
            payload_b,
            salt,
            kmacs: Vec::new(),
            mac,
        },
        round_id,
        target: None,
    }
}

#[tokio::test]
async fn stale_round_updates_are_ignored() {
    let h = harness();
    h.instance.round_update(round(10, 50, RoundState::Standby)).unwrap();
    h.instance.round_update(round(10, 0, RoundState::Failed)).unwrap();

    let stored = h.instance.storage().db().get_round(10).unwrap();
    assert_eq!(stored.update_id, 50);
    assert_eq!(stored.state, RoundState::Standby);

    let resp = h
        .instance
        .request_historical_rounds(HistoricalRounds {
            rounds: vec![10, 99],
            target: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.rounds.len(), 1);
    assert_eq!(resp.rounds[0].update_id, 50);
}

#[tokio::test]
async fn completed_batch_is_retrievable_per_recipient() {
    let h = harness();
    h.instance.round_update(round(10, 1, RoundState::Completed)).unwrap();
    h.instance.round_update(round(11, 1, RoundState::Completed)).unwrap();

    let recipient = EphemeralId::from_i64(4242);
    let make_slot = |tag: u8| {
        let mut msg = Message::new(64).unwrap();
        let mut payload = vec![0u8; 64];
        payload[40] = tag;
        msg.set_payload_a(&payload).unwrap();
        msg.set_ephemeral_rid(recipient);
        msg.set_identity_fp(&[3u8; IDENTITY_FP_LEN]);
        MixedSlot {
            payload_a: msg.payload_a().to_vec(),
            payload_b: msg.payload_b().to_vec(),
        }
    };

    h.instance
        .process_completed_batch(vec![make_slot(1), make_slot(2), make_slot(3)], 10)
        .await
        .unwrap();
    h.instance
        .process_completed_batch(vec![make_slot(4)], 11)
        .await
        .unwrap();

    let resp = h
        .instance
        .request_messages(GetMessages {
            client_id: recipient.to_bytes().to_vec(),
            round_id: 10,
            target: None,
        })
        .await
        .unwrap();
    assert!(resp.has_round);
    assert_eq!(resp.messages.len(), 3);

    // Round we never saw: not ours, nothing to return.
    let resp = h
        .instance
        .request_messages(GetMessages {
            client_id: recipient.to_bytes().to_vec(),
            round_id: 12,
            target: None,
        })
        .await
        .unwrap();
    assert!(!resp.has_round);
    assert!(resp.messages.is_empty());
}

#[tokio::test]
async fn dummy_and_masked_out_messages_are_dropped() {
    let h = harness();
    h.instance.round_update(round(10, 1, RoundState::Completed)).unwrap();

    // A dummy (zero fingerprint) and a recipient whose ephemeral id clears
    // to zero under the 16-bit address space.
    let dummy = MixedSlot {
        payload_a: vec![0u8; 64],
        payload_b: vec![0u8; 64],
    };
    let mut masked = Message::new(64).unwrap();
    masked.set_ephemeral_rid(EphemeralId::from_i64(0x7fff_0000));
    masked.set_identity_fp(&[1u8; IDENTITY_FP_LEN]);
    let masked = MixedSlot {
        payload_a: masked.payload_a().to_vec(),
        payload_b: masked.payload_b().to_vec(),
    };

    h.instance
        .process_completed_batch(vec![dummy, masked], 10)
        .await
        .unwrap();

    assert_eq!(
        h.instance
            .storage()
            .db()
            .count_mixed_messages_by_round(10)
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn completed_batch_waits_then_times_out_without_round_data() {
    let h = harness();
    let slot = MixedSlot {
        payload_a: vec![0u8; 64],
        payload_b: vec![0u8; 64],
    };
    let started = std::time::Instant::now();
    let err = h
        .instance
        .process_completed_batch(vec![slot], 404)
        .await
        .unwrap_err();
    assert!(matches!(err, HazeError::Timeout(_)));
    assert!(started.elapsed() >= std::time::Duration::from_secs(3));
}

#[tokio::test]
async fn upload_pads_with_deterministic_junk() {
    let h = harness();
    let sender = Id::from_label("someone", IdKind::User);
    for i in 0..4u8 {
        h.instance
            .unmixed()
            .add_unmixed_message(
                Slot {
                    sender_id: sender,
                    payload_a: vec![i; 64],
                    payload_b: vec![i; 64],
                    salt: vec![0; 32],
                    kmacs: Vec::new(),
                    mac: Vec::new(),
                },
                10,
                10,
            )
            .unwrap();
    }

    let info = round(10, 1, RoundState::Queued);
    h.instance.upload_unmixed_batch(&info).await;

    let uploads = h.comms.uploads.lock();
    assert_eq!(uploads.len(), 1);
    let batch = &uploads[0];
    assert_eq!(batch.slots.len(), 10);

    for (i, slot) in batch.slots.iter().enumerate().skip(4) {
        let msg = Message::from_payloads(&slot.payload_a, &slot.payload_b).unwrap();
        assert!(msg.is_dummy(), "slot {i} should be junk");
        // Position counter is encoded at offset 1, one-based.
        assert_eq!(&slot.payload_a[1..5], &(i as u32 + 1).to_le_bytes());
    }
    // Real slots come first, untouched.
    assert_eq!(batch.slots[0].payload_a, vec![0u8; 64]);

    // A second upload finds nothing: the round was popped.
    drop(uploads);
    h.instance.upload_unmixed_batch(&info).await;
    assert_eq!(h.comms.uploads.lock().len(), 1);
}

#[tokio::test]
async fn put_message_authenticates_and_buffers() {
    let h = harness();
    h.instance.round_update(round(42, 1, RoundState::Standby)).unwrap();

    let sender = Id::from_label("client-1", IdKind::User);
    let key = b"relationship-key".to_vec();
    h.instance
        .storage()
        .db()
        .insert_client(Client {
            id: sender,
            key: key.clone(),
        })
        .unwrap();

    let good = authenticated_slot(sender, &key, 42);
    let resp = h.instance.put_message(good, "9.9.9.9").await.unwrap();
    assert!(resp.accepted);
    assert_eq!(resp.round_id, 42);
    assert_eq!(h.instance.unmixed().len_unmixed(42), 1);

    // Any bit flip in the salt invalidates the MAC.
    let mut bad = authenticated_slot(sender, &key, 42);
    bad.message.salt[0] ^= 0x01;
    let err = h.instance.put_message(bad, "9.9.9.9").await.unwrap_err();
    assert!(matches!(err, HazeError::Unauthenticated(_)));
    assert_eq!(h.instance.unmixed().len_unmixed(42), 1);

    // An unregistered sender is rejected outright.
    let stranger = authenticated_slot(Id::from_label("nobody", IdKind::User), &key, 42);
    let err = h.instance.put_message(stranger, "9.9.9.9").await.unwrap_err();
    assert!(matches!(err, HazeError::Unauthenticated(_)));
}

#[tokio::test]
async fn put_message_rate_limits_repeat_senders() {
    let h = harness();
    let sender = Id::from_label("chatty", IdKind::User);
    let key = b"k".to_vec();
    h.instance
        .storage()
        .db()
        .insert_client(Client {
            id: sender,
            key: key.clone(),
        })
        .unwrap();

    // Admission bucket holds one token: the second message inside the leak
    // interval is refused.
    h.instance
        .put_message(authenticated_slot(sender, &key, 1), "8.8.8.8")
        .await
        .unwrap();
    let err = h
        .instance
        .put_message(authenticated_slot(sender, &key, 1), "8.8.8.8")
        .await
        .unwrap_err();
    assert!(matches!(err, HazeError::RateLimited(_)));

    // A whitelisted source IP bypasses the bucket.
    h.instance.message_rate_limit().whitelist("10.0.0.1");
    h.instance
        .put_message(authenticated_slot(sender, &key, 1), "10.0.0.1")
        .await
        .unwrap();
}

#[tokio::test]
async fn put_many_messages_is_all_or_nothing_on_auth() {
    let h = harness();
    let sender = Id::from_label("batcher", IdKind::User);
    let key = b"bk".to_vec();
    h.instance
        .storage()
        .db()
        .insert_client(Client {
            id: sender,
            key: key.clone(),
        })
        .unwrap();

    let mut batch = GatewaySlots {
        messages: vec![
            authenticated_slot(sender, &key, 6),
            authenticated_slot(sender, &key, 6),
        ],
        round_id: 6,
        target: None,
    };
    batch.messages[1].message.mac[0] ^= 0xff;

    assert!(h.instance.put_many_messages(batch, "7.7.7.7").await.is_err());
    assert_eq!(h.instance.unmixed().len_unmixed(6), 0);
}

#[tokio::test]
async fn proxy_forwards_to_sibling_and_processes_self_locally() {
    let h = harness();
    let sibling = Id::from_label("sibling-gw", IdKind::Gateway);
    h.instance
        .hosts()
        .add(Host::new(sibling, "127.0.0.1:1".into()));

    let sender = Id::from_label("client-2", IdKind::User);
    let key = b"pk".to_vec();
    h.instance
        .storage()
        .db()
        .insert_client(Client {
            id: sender,
            key: key.clone(),
        })
        .unwrap();

    // Target = sibling: forwarded verbatim, sibling's response returned.
    let mut msg = authenticated_slot(sender, &key, 5);
    msg.target = Some(sibling);
    let resp = h.instance.put_message(msg.clone(), "6.6.6.6").await.unwrap();
    assert_eq!(resp.round_id, 777);
    assert_eq!(h.comms.forwarded_puts.lock().len(), 1);
    assert_eq!(h.instance.unmixed().len_unmixed(5), 0);

    // Target = self: processed locally.
    msg.target = Some(h.instance.id());
    let resp = h.instance.put_message(msg.clone(), "6.6.6.6").await.unwrap();
    assert!(resp.accepted);
    assert_eq!(h.instance.unmixed().len_unmixed(5), 1);

    // Unknown target.
    msg.target = Some(Id::from_label("ghost-gw", IdKind::Gateway));
    let err = h.instance.put_message(msg.clone(), "6.6.6.6").await.unwrap_err();
    assert!(matches!(err, HazeError::NoTarget(_)));

    // Known but disconnected target.
    let down = Id::from_label("down-gw", IdKind::Gateway);
    let host = Host::new(down, "127.0.0.1:2".into());
    host.set_connected(false);
    h.instance.hosts().add(host);
    msg.target = Some(down);
    let err = h.instance.put_message(msg, "6.6.6.6").await.unwrap_err();
    assert!(matches!(err, HazeError::NotConnected(_)));
}

#[tokio::test]
async fn request_client_key_stores_and_scrubs_relationship_key() {
    let h = harness();
    let client_key = signature::generate_keypair().unwrap();
    let pubkey_der = signature::public_key_der(&rsa::RsaPublicKey::from(&client_key)).unwrap();
    let salt = vec![5u8; 32];

    let inner = haze_gateway::rpc::ClientKeyRequest {
        client_pubkey_der: pubkey_der.clone(),
        salt: salt.clone(),
        request_timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64,
    };
    let signed = SignedClientKeyRequest {
        client_key_request: serde_cbor::to_vec(&inner).unwrap(),
        signature: Vec::new(),
        target: None,
    };

    let resp = h.instance.request_client_key(signed).await.unwrap();
    // The relationship key never leaves the gateway.
    assert!(resp.client_gateway_key.is_empty());
    // The countersignature verifies under the gateway's key.
    let public = rsa::RsaPublicKey::from(h.instance.private_key().as_ref());
    signature::verify(
        &public,
        &resp.key_response,
        &resp.key_response_signed_by_gateway,
    )
    .unwrap();

    // The derived user is registered with the node's relationship key.
    let user_id = signature::user_id_from_key(&pubkey_der, &salt);
    let stored = h.instance.storage().db().get_client(&user_id).unwrap();
    assert_eq!(stored.key, b"relationship-key");

    // A stale timestamp is rejected.
    let old = haze_gateway::rpc::ClientKeyRequest {
        request_timestamp: 0,
        ..inner
    };
    let stale = SignedClientKeyRequest {
        client_key_request: serde_cbor::to_vec(&old).unwrap(),
        signature: Vec::new(),
        target: None,
    };
    assert!(h.instance.request_client_key(stale).await.is_err());
}

#[tokio::test]
async fn inbound_bloom_gossip_upserts_filters_and_records_round() {
    // Origin gateway publishes its key in the NDF and sits (as a node) in
    // round 10's topology.
    let origin_key = signature::generate_keypair().unwrap();
    let origin = Id::from_label("origin-gw", IdKind::Gateway);
    let ndf = NetworkDefinition {
        gateways: vec![NdfGateway {
            id: origin,
            address: "127.0.0.1:3".into(),
            public_key_pem: signature::public_key_to_pem(&rsa::RsaPublicKey::from(&origin_key))
                .unwrap(),
        }],
        ..Default::default()
    };
    let h = harness_with(ndf, false);
    h.instance.init_gossip(ManagerFlags::default());

    let mut ri = round(10, 10, RoundState::Completed);
    ri.topology = vec![origin.set_kind(IdKind::Node)];
    h.instance.round_update(ri).unwrap();

    let recipients = [1i64, 2, 3].map(EphemeralId::from_i64);
    let payload = RoundIdsPayload {
        round_id: 10,
        ids: recipients.iter().map(|r| r.to_bytes().to_vec()).collect(),
    };
    let mut msg = GossipMessage {
        tag: BLOOM_FILTER_TAG.into(),
        origin,
        payload: payload.encode().unwrap(),
        signature: Vec::new(),
    };
    msg.signature = signature::sign(&origin_key, &msg.signable()).unwrap();

    h.instance.gossip_manager().unwrap().receive(&msg).unwrap();

    // Epoch = floor(queued-timestamp / epoch-duration) = 2h / 1h.
    for recipient in recipients {
        let filters = h
            .instance
            .storage()
            .db()
            .get_client_bloom_filters(recipient.int64(), 0, 100)
            .unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].epoch, 2);
        assert_eq!(filters[0].first_round, 10);
    }
    assert!(h.instance.known_rounds_checked(10));
}

#[tokio::test]
async fn gossip_from_outside_topology_is_rejected() {
    let origin_key = signature::generate_keypair().unwrap();
    let origin = Id::from_label("origin-gw", IdKind::Gateway);
    let ndf = NetworkDefinition {
        gateways: vec![NdfGateway {
            id: origin,
            address: "127.0.0.1:3".into(),
            public_key_pem: signature::public_key_to_pem(&rsa::RsaPublicKey::from(&origin_key))
                .unwrap(),
        }],
        ..Default::default()
    };
    let h = harness_with(ndf, false);
    h.instance.init_gossip(ManagerFlags::default());

    // Round 10's topology does NOT contain the origin.
    h.instance.round_update(round(10, 10, RoundState::Completed)).unwrap();

    let payload = RoundIdsPayload {
        round_id: 10,
        ids: vec![EphemeralId::from_i64(1).to_bytes().to_vec()],
    };
    let mut msg = GossipMessage {
        tag: BLOOM_FILTER_TAG.into(),
        origin,
        payload: payload.encode().unwrap(),
        signature: Vec::new(),
    };
    msg.signature = signature::sign(&origin_key, &msg.signable()).unwrap();

    let err = h.instance.gossip_manager().unwrap().receive(&msg).unwrap_err();
    assert!(matches!(err, HazeError::Unauthenticated(_)));

    // A tampered signature on a valid topology is also rejected.
    let mut ri = round(11, 11, RoundState::Completed);
    ri.topology = vec![origin.set_kind(IdKind::Node)];
    h.instance.round_update(ri).unwrap();
    let payload = RoundIdsPayload {
        round_id: 11,
        ids: vec![EphemeralId::from_i64(1).to_bytes().to_vec()],
    };
    let mut forged = GossipMessage {
        tag: BLOOM_FILTER_TAG.into(),
        origin,
        payload: payload.encode().unwrap(),
        signature: Vec::new(),
    };
    forged.signature = signature::sign(&origin_key, &forged.signable()).unwrap();
    forged.signature[0] ^= 0xff;
    assert!(h.instance.gossip_manager().unwrap().receive(&forged).is_err());
}
