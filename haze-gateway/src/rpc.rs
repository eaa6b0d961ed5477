#![forbid(unsafe_code)]

//! Client- and peer-facing RPC shapes. Framing is CBOR over a length-prefixed
//! stream; these types define only the semantics.

use serde::{Deserialize, Serialize};

use haze_core::id::Id;
use haze_core::rounds::Round;
use haze_storage::Slot;

/// One client slot bound for a specific round, possibly proxied through this
/// gateway to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySlot {
    pub message: Slot,
    pub round_id: u64,
    pub target: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySlots {
    pub messages: Vec<GatewaySlot>,
    pub round_id: u64,
    pub target: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySlotResponse {
    pub accepted: bool,
    pub round_id: u64,
}

/// Retrieval request: an ephemeral recipient identifier and a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMessages {
    pub client_id: Vec<u8>,
    pub round_id: u64,
    pub target: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadPair {
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMessagesResponse {
    pub messages: Vec<PayloadPair>,
    pub has_round: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalRounds {
    pub rounds: Vec<u64>,
    pub target: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalRoundsResponse {
    pub rounds: Vec<Round>,
}

/// Inner registration request, serialized inside the signed wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKeyRequest {
    /// DER form of the client's registration public key.
    pub client_pubkey_der: Vec<u8>,
    pub salt: Vec<u8>,
    /// Nanosecond timestamp; rejected when too far from now.
    pub request_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedClientKeyRequest {
    /// CBOR-encoded [`ClientKeyRequest`].
    pub client_key_request: Vec<u8>,
    pub signature: Vec<u8>,
    pub target: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignedKeyResponse {
    /// The node's response blob, countersigned below.
    pub key_response: Vec<u8>,
    /// Gateway signature over `key_response`, verifiable by the client.
    pub key_response_signed_by_gateway: Vec<u8>,
    /// Shared secret between client and node; zeroed before any reply leaves
    /// this gateway.
    pub client_gateway_key: Vec<u8>,
}

/// One slot of mixed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedSlot {
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
}

/// A padded unmixed batch on its way into the mix server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub round: Round,
    pub from_phase: i32,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    pub ephemeral_id: i64,
    pub identity_fp: Vec<u8>,
    pub message_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub round_id: u64,
    pub notifications: Vec<NotificationData>,
}

/// Mixed output as delivered by the fronted server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBatch {
    pub round_id: u64,
    pub slots: Vec<MixedSlot>,
}
