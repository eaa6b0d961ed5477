#![forbid(unsafe_code)]

//! Persistent, query-shaped storage for mixed messages, per-round client
//! rows, and client bloom filters. The [`Storage`] facade merges the business
//! rules (has-round detection, filter construction) with an interchangeable
//! [`store::Database`] backing.

pub mod map_impl;
pub mod models;
pub mod sled_impl;
pub mod store;
pub mod unmixed_buffer;

use std::path::Path;
use std::sync::Arc;

use haze_core::ephemeral::EphemeralId;
use haze_core::HazeResult;

use crate::models::{ClientBloomFilter, MixedMessage};
use crate::store::Database;

pub use crate::models::{Client, ClientRound, RoundBatch, Slot};
pub use crate::unmixed_buffer::UnmixedBuffer;

/// High-level storage API shared by the orchestrator and gossip handlers.
#[derive(Clone)]
pub struct Storage {
    db: Arc<dyn Database>,
}

impl Storage {
    /// In-memory backing, for tests and dev mode.
    pub fn in_memory() -> Self {
        Storage {
            db: Arc::new(map_impl::MapImpl::new()),
        }
    }

    /// Durable backing rooted at `path`.
    pub fn durable(path: &Path) -> HazeResult<Self> {
        Ok(Storage {
            db: Arc::new(sled_impl::SledImpl::open(path)?),
        })
    }

    pub fn db(&self) -> &dyn Database {
        self.db.as_ref()
    }

    /// Messages for `(recipient, round)` plus whether this gateway holds the
    /// round at all. A false flag with an empty list means "round not ours";
    /// a true flag with an empty list means "ours, but nothing for you".
    pub fn get_mixed_messages(
        &self,
        recipient: EphemeralId,
        round_id: u64,
    ) -> HazeResult<(Vec<MixedMessage>, bool)> {
        let has_round = self.db.count_mixed_messages_by_round(round_id)? > 0;
        if !has_round {
            return Ok((Vec::new(), false));
        }
        Ok((self.db.get_mixed_messages(recipient, round_id)?, true))
    }

    /// Build a filter row for `(recipient, epoch)` covering `round_id` and
    /// commit it through the OR-merge upsert.
    pub fn handle_bloom_filter(
        &self,
        recipient: EphemeralId,
        filter_bytes: Vec<u8>,
        round_id: u64,
        epoch: u32,
    ) -> HazeResult<()> {
        self.db.upsert_client_bloom_filter(ClientBloomFilter {
            recipient_id: recipient.int64(),
            epoch,
            first_round: round_id,
            round_range: 0,
            filter: filter_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_core::id::{Id, IdKind};
    use haze_core::rounds::{Round, RoundState, NUM_STATES};

    fn round(id: u64, update_id: u64) -> Round {
        Round {
            id,
            update_id,
            state: RoundState::Queued,
            batch_size: 8,
            topology: vec![Id::from_label("n0", IdKind::Node)],
            timestamps: [0; NUM_STATES],
            address_space_size: 16,
            info_blob: Vec::new(),
        }
    }

    fn backings() -> Vec<(&'static str, Storage, Option<tempfile::TempDir>)> {
        let dir = tempfile::tempdir().unwrap();
        let durable = Storage::durable(dir.path()).unwrap();
        vec![
            ("map", Storage::in_memory(), None),
            ("sled", durable, Some(dir)),
        ]
    }

    #[test]
    fn round_upsert_is_monotone_in_update_id() {
        for (name, storage, _guard) in backings() {
            storage.db().upsert_round(round(10, 50)).unwrap();
            storage.db().upsert_round(round(10, 0)).unwrap();
            assert_eq!(storage.db().get_round(10).unwrap().update_id, 50, "{name}");

            storage.db().upsert_round(round(10, 51)).unwrap();
            assert_eq!(storage.db().get_round(10).unwrap().update_id, 51, "{name}");
        }
    }

    #[test]
    fn get_rounds_allows_partial_results() {
        for (name, storage, _guard) in backings() {
            storage.db().upsert_round(round(1, 1)).unwrap();
            let found = storage.db().get_rounds(&[1, 2, 3]).unwrap();
            assert_eq!(found.len(), 1, "{name}");
            assert!(storage.db().get_rounds(&[7, 8]).is_err(), "{name}");
        }
    }

    #[test]
    fn mixed_messages_index_both_ways() {
        for (name, storage, _guard) in backings() {
            let recipient = EphemeralId::from_i64(40);
            let cr = ClientRound {
                id: 10,
                timestamp: 0,
                messages: vec![
                    models::MixedMessage::new(10, recipient, b"aa", b"bb"),
                    models::MixedMessage::new(10, recipient, b"cc", b"dd"),
                    models::MixedMessage::new(10, recipient, b"ee", b"ff"),
                ],
            };
            storage.db().insert_mixed_messages(&cr).unwrap();
            storage
                .db()
                .insert_mixed_messages(&ClientRound {
                    id: 11,
                    timestamp: 0,
                    messages: vec![models::MixedMessage::new(11, recipient, b"gg", b"hh")],
                })
                .unwrap();

            assert_eq!(
                storage.db().count_mixed_messages_by_round(10).unwrap(),
                3,
                "{name}"
            );

            let (msgs, has_round) = storage.get_mixed_messages(recipient, 10).unwrap();
            assert!(has_round, "{name}");
            assert_eq!(msgs.len(), 3, "{name}");

            let (msgs, has_round) = storage.get_mixed_messages(recipient, 12).unwrap();
            assert!(!has_round, "{name}");
            assert!(msgs.is_empty(), "{name}");

            // Round present but nothing for this recipient.
            let stranger = EphemeralId::from_i64(900);
            let (msgs, has_round) = storage.get_mixed_messages(stranger, 10).unwrap();
            assert!(has_round, "{name}");
            assert!(msgs.is_empty(), "{name}");
        }
    }

    #[test]
    fn duplicate_triple_rejected_atomically() {
        for (name, storage, _guard) in backings() {
            let recipient = EphemeralId::from_i64(5);
            let mut msg = models::MixedMessage::new(3, recipient, b"aa", b"bb");
            msg.id = 77;
            storage
                .db()
                .insert_mixed_messages(&ClientRound {
                    id: 3,
                    timestamp: 0,
                    messages: vec![msg.clone()],
                })
                .unwrap();

            let mut fresh = models::MixedMessage::new(3, recipient, b"cc", b"dd");
            fresh.id = 78;
            let err = storage
                .db()
                .insert_mixed_messages(&ClientRound {
                    id: 3,
                    timestamp: 0,
                    messages: vec![fresh, msg],
                })
                .unwrap_err();
            assert!(
                matches!(err, haze_core::HazeError::AlreadyExists(_)),
                "{name}"
            );
            // The whole group was rejected.
            assert_eq!(
                storage.db().count_mixed_messages_by_round(3).unwrap(),
                1,
                "{name}"
            );
        }
    }

    #[test]
    fn delete_by_round_clears_both_indices() {
        for (name, storage, _guard) in backings() {
            let recipient = EphemeralId::from_i64(5);
            storage
                .db()
                .insert_mixed_messages(&ClientRound {
                    id: 100,
                    timestamp: 0,
                    messages: vec![
                        models::MixedMessage::new(100, recipient, b"aa", b"bb"),
                        models::MixedMessage::new(100, recipient, b"cc", b"dd"),
                    ],
                })
                .unwrap();
            storage
                .db()
                .insert_mixed_messages(&ClientRound {
                    id: 2,
                    timestamp: 0,
                    messages: vec![models::MixedMessage::new(2, recipient, b"ee", b"ff")],
                })
                .unwrap();

            storage.db().delete_mixed_messages_by_round(100).unwrap();

            let (msgs, has_round) = storage.get_mixed_messages(recipient, 100).unwrap();
            assert!(!has_round, "{name}");
            assert!(msgs.is_empty(), "{name}");
            // The other round is untouched.
            let (msgs, has_round) = storage.get_mixed_messages(recipient, 2).unwrap();
            assert!(has_round, "{name}");
            assert_eq!(msgs.len(), 1, "{name}");
        }
    }

    #[test]
    fn bloom_upsert_merges_by_or() {
        for (name, storage, _guard) in backings() {
            let recipient = EphemeralId::from_i64(12);
            storage
                .handle_bloom_filter(recipient, vec![0b0001, 0b0000], 20, 4)
                .unwrap();
            storage
                .handle_bloom_filter(recipient, vec![0b0001, 0b0000], 20, 4)
                .unwrap();
            storage
                .handle_bloom_filter(recipient, vec![0b0100, 0b0010], 25, 4)
                .unwrap();

            let filters = storage.db().get_client_bloom_filters(12, 0, 100).unwrap();
            assert_eq!(filters.len(), 1, "{name}");
            assert_eq!(filters[0].filter, vec![0b0101, 0b0010], "{name}");
            assert_eq!(filters[0].first_round, 20, "{name}");
            assert_eq!(filters[0].round_range, 5, "{name}");
        }
    }

    #[test]
    fn filters_expire_by_epoch() {
        for (name, storage, _guard) in backings() {
            let recipient = EphemeralId::from_i64(1);
            storage.handle_bloom_filter(recipient, vec![1], 5, 1).unwrap();
            storage.handle_bloom_filter(recipient, vec![1], 9, 3).unwrap();
            storage.db().insert_epoch(5, 1).unwrap();
            storage.db().insert_epoch(9, 3).unwrap();

            storage.db().delete_client_filters_before_epoch(3).unwrap();
            let filters = storage.db().get_client_bloom_filters(1, 0, 100).unwrap();
            assert_eq!(filters.len(), 1, "{name}");
            assert_eq!(filters[0].epoch, 3, "{name}");

            let expired = storage.db().delete_epochs_before(3).unwrap();
            assert_eq!(expired, vec![5], "{name}");
        }
    }

    #[test]
    fn clients_insert_and_upsert() {
        for (name, storage, _guard) in backings() {
            let id = Id::from_label("c1", IdKind::User);
            storage
                .db()
                .insert_client(Client {
                    id,
                    key: b"k1".to_vec(),
                })
                .unwrap();
            assert!(
                storage
                    .db()
                    .insert_client(Client {
                        id,
                        key: b"k2".to_vec(),
                    })
                    .is_err(),
                "{name}"
            );
            storage
                .db()
                .upsert_client(Client {
                    id,
                    key: b"k3".to_vec(),
                })
                .unwrap();
            assert_eq!(storage.db().get_client(&id).unwrap().key, b"k3", "{name}");
        }
    }
}
