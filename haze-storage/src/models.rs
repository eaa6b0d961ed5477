#![forbid(unsafe_code)]

//! Stored row types and the wire slot shapes they are built from.

use serde::{Deserialize, Serialize};

use haze_core::ephemeral::EphemeralId;
use haze_core::id::Id;

/// A registered client and its shared secret with the fronted mix server.
/// The key is learned at registration and must never leave this process on a
/// proxy reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Id,
    pub key: Vec<u8>,
}

/// One unmixed client message as accepted by `PutMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub sender_id: Id,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
    pub salt: Vec<u8>,
    pub kmacs: Vec<Vec<u8>>,
    pub mac: Vec<u8>,
}

/// Accumulated slots for one round, awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundBatch {
    pub round_id: u64,
    pub from_phase: i32,
    pub batch_size: u32,
    pub slots: Vec<Slot>,
}

/// A mixed message addressed to one ephemeral recipient. `id` is unique only
/// within `(round_id, recipient_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedMessage {
    pub id: u64,
    pub round_id: u64,
    pub recipient_id: EphemeralId,
    /// `payload_a ‖ payload_b`; the halves have equal width.
    pub contents: Vec<u8>,
}

impl MixedMessage {
    pub fn new(round_id: u64, recipient_id: EphemeralId, payload_a: &[u8], payload_b: &[u8]) -> Self {
        let mut contents = Vec::with_capacity(payload_a.len() + payload_b.len());
        contents.extend_from_slice(payload_a);
        contents.extend_from_slice(payload_b);
        MixedMessage {
            id: 0,
            round_id,
            recipient_id,
            contents,
        }
    }

    /// Recover the wire halves from the stored concatenation.
    pub fn message_contents(&self) -> (&[u8], &[u8]) {
        self.contents.split_at(self.contents.len() / 2)
    }
}

/// One round's mixed messages, inserted as an atomic group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRound {
    pub id: u64,
    /// Nanosecond timestamp of the round's QUEUED transition.
    pub timestamp: i64,
    pub messages: Vec<MixedMessage>,
}

/// Per-recipient, per-epoch membership summary of rounds with messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBloomFilter {
    pub recipient_id: i64,
    pub epoch: u32,
    pub first_round: u64,
    /// Width of the covered interval: the last covered round is
    /// `first_round + round_range`.
    pub round_range: u32,
    pub filter: Vec<u8>,
}

impl ClientBloomFilter {
    /// Merge `other` into this filter: bitwise OR of the bits and the union
    /// of the covered round intervals.
    pub fn combine(&mut self, other: &ClientBloomFilter) {
        if self.filter.is_empty() {
            self.filter = other.filter.clone();
        } else if self.filter.len() == other.filter.len() {
            for (byte, o) in self.filter.iter_mut().zip(&other.filter) {
                *byte |= o;
            }
        } else {
            tracing::error!(
                ours = self.filter.len(),
                theirs = other.filter.len(),
                "cannot OR filters of differing widths, keeping ours"
            );
        }

        let self_end = self.first_round + u64::from(self.round_range);
        let other_end = other.first_round + u64::from(other.round_range);
        self.first_round = self.first_round.min(other.first_round);
        self.round_range = (self_end.max(other_end) - self.first_round) as u32;
    }

    /// Whether the covered interval intersects `[first, last]`.
    pub fn intersects(&self, first: u64, last: u64) -> bool {
        let end = self.first_round + u64::from(self.round_range);
        self.first_round <= last && end >= first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_core::id::IdKind;

    #[test]
    fn mixed_message_splits_contents_evenly() {
        let recipient = EphemeralId::from_i64(9);
        let mm = MixedMessage::new(10, recipient, b"left", b"rite");
        let (a, b) = mm.message_contents();
        assert_eq!(a, b"left");
        assert_eq!(b, b"rite");
        assert_eq!(mm.id, 0);
    }

    #[test]
    fn combine_is_idempotent() {
        let f = ClientBloomFilter {
            recipient_id: 4,
            epoch: 2,
            first_round: 10,
            round_range: 0,
            filter: vec![0b0011, 0b1000],
        };
        let mut merged = f.clone();
        merged.combine(&f);
        assert_eq!(merged, f);
    }

    #[test]
    fn combine_unions_intervals() {
        let mut a = ClientBloomFilter {
            recipient_id: 4,
            epoch: 2,
            first_round: 10,
            round_range: 5,
            filter: vec![0b0001],
        };
        let b = ClientBloomFilter {
            recipient_id: 4,
            epoch: 2,
            first_round: 7,
            round_range: 4,
            filter: vec![0b0100],
        };
        a.combine(&b);
        assert_eq!(a.first_round, 7);
        // Covered rounds now span [7, 15].
        assert_eq!(a.round_range, 8);
        assert_eq!(a.filter, vec![0b0101]);
    }

    #[test]
    fn interval_intersection() {
        let f = ClientBloomFilter {
            recipient_id: 1,
            epoch: 0,
            first_round: 10,
            round_range: 5,
            filter: Vec::new(),
        };
        assert!(f.intersects(15, 20));
        assert!(f.intersects(1, 10));
        assert!(!f.intersects(16, 20));
        assert!(!f.intersects(1, 9));
    }

    #[test]
    fn slot_round_trips_through_cbor() {
        let slot = Slot {
            sender_id: Id::from_label("sender", IdKind::User),
            payload_a: vec![1; 8],
            payload_b: vec![2; 8],
            salt: vec![3; 32],
            kmacs: vec![vec![4; 32]],
            mac: vec![5; 32],
        };
        let enc = serde_cbor::to_vec(&slot).unwrap();
        let dec: Slot = serde_cbor::from_slice(&enc).unwrap();
        assert_eq!(slot, dec);
    }
}
