#![forbid(unsafe_code)]

//! Over-the-wire gossip envelope and the shared round-summary payload.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use haze_core::id::Id;
use haze_core::HazeResult;

/// Protocol tag for sender summaries feeding rate-limit credits.
pub const RATE_LIMIT_TAG: &str = "RateLimit";
/// Protocol tag for recipient summaries feeding bloom filters.
pub const BLOOM_FILTER_TAG: &str = "Bloom";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub tag: String,
    pub origin: Id,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl GossipMessage {
    /// Bytes covered by the envelope signature: `tag ‖ origin ‖ payload`.
    pub fn signable(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(self.tag.len() + self.origin.as_bytes().len() + self.payload.len());
        data.extend_from_slice(self.tag.as_bytes());
        data.extend_from_slice(self.origin.as_bytes());
        data.extend_from_slice(&self.payload);
        data
    }

    /// Digest used for seen-message deduplication.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.signable());
        hasher.update(&self.signature);
        hasher.finalize().into()
    }
}

/// Payload shared by both channels: one round and the identifiers involved.
/// Sender summaries carry full 33-byte identifiers; recipient summaries carry
/// 8-byte ephemerals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundIdsPayload {
    pub round_id: u64,
    pub ids: Vec<Vec<u8>>,
}

impl RoundIdsPayload {
    pub fn encode(&self) -> HazeResult<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(Into::into)
    }

    pub fn decode(raw: &[u8]) -> HazeResult<Self> {
        serde_cbor::from_slice(raw).map_err(Into::into)
    }
}
