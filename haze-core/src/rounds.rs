#![forbid(unsafe_code)]

//! Round model: lifecycle states, topology, and the monotone update rule.

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// Lifecycle states, in order. The mix network owns all transitions; the
/// gateway only ever reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RoundState {
    Pending = 0,
    Precomputing = 1,
    Standby = 2,
    Queued = 3,
    Realtime = 4,
    Completed = 5,
    Failed = 6,
}

/// Number of lifecycle states, sizing the per-state timestamp table.
pub const NUM_STATES: usize = 7;

impl RoundState {
    pub fn as_index(self) -> usize {
        self as usize
    }
}

/// One mixnet batch cycle as advertised by the scheduling authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: u64,
    /// Monotonically increasing version; stale updates are silently dropped.
    pub update_id: u64,
    pub state: RoundState,
    pub batch_size: u32,
    /// Ordered node identifiers participating in this round.
    pub topology: Vec<Id>,
    /// Nanosecond timestamps indexed by [`RoundState`].
    pub timestamps: [i64; NUM_STATES],
    /// Meaningful bits of an ephemeral recipient identifier.
    pub address_space_size: u8,
    /// Signed blob from the scheduling authority, kept opaque.
    pub info_blob: Vec<u8>,
}

impl Round {
    pub fn timestamp(&self, state: RoundState) -> i64 {
        self.timestamps[state.as_index()]
    }

    /// Whether `node` appears in this round's topology.
    pub fn topology_contains(&self, node: &Id) -> bool {
        self.topology.iter().any(|n| n == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdKind;

    fn round_with_topology(nodes: &[Id]) -> Round {
        Round {
            id: 10,
            update_id: 1,
            state: RoundState::Queued,
            batch_size: 4,
            topology: nodes.to_vec(),
            timestamps: [0; NUM_STATES],
            address_space_size: 16,
            info_blob: Vec::new(),
        }
    }

    #[test]
    fn states_are_ordered() {
        assert!(RoundState::Pending < RoundState::Queued);
        assert!(RoundState::Queued < RoundState::Completed);
        assert!(RoundState::Realtime >= RoundState::Queued);
    }

    #[test]
    fn topology_lookup_uses_byte_equality() {
        let node = Id::from_label("n0", IdKind::Node);
        let round = round_with_topology(&[node]);
        assert!(round.topology_contains(&node));
        assert!(!round.topology_contains(&node.set_kind(IdKind::Gateway)));
    }
}
