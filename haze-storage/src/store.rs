#![forbid(unsafe_code)]

//! Capability set implemented by every store backing. The durable and
//! in-memory variants must be observably identical apart from durability.

use haze_core::ephemeral::EphemeralId;
use haze_core::id::Id;
use haze_core::rounds::Round;
use haze_core::HazeResult;

use crate::models::{Client, ClientBloomFilter, ClientRound, MixedMessage};

pub trait Database: Send + Sync {
    /// Fails `AlreadyExists` when the client is present, `Invalid` on a
    /// malformed identifier.
    fn insert_client(&self, client: Client) -> HazeResult<()>;

    /// Replaces the key unconditionally; creates when absent.
    fn upsert_client(&self, client: Client) -> HazeResult<()>;

    fn get_client(&self, id: &Id) -> HazeResult<Client>;

    /// Inserts, or replaces only when the update id is strictly newer. A
    /// stale update is a silent no-op, never an error.
    fn upsert_round(&self, round: Round) -> HazeResult<()>;

    fn get_round(&self, id: u64) -> HazeResult<Round>;

    /// Partial results are fine; fails `NotFound` only when none of the
    /// requested rounds are present.
    fn get_rounds(&self, ids: &[u64]) -> HazeResult<Vec<Round>>;

    /// All-or-nothing per round. Fails `AlreadyExists` when any
    /// (round, recipient, message-id) triple is already stored.
    fn insert_mixed_messages(&self, round: &ClientRound) -> HazeResult<()>;

    fn get_mixed_messages(
        &self,
        recipient: EphemeralId,
        round_id: u64,
    ) -> HazeResult<Vec<MixedMessage>>;

    fn count_mixed_messages_by_round(&self, round_id: u64) -> HazeResult<u64>;

    fn delete_mixed_messages_by_round(&self, round_id: u64) -> HazeResult<()>;

    /// OR-merges into any filter stored for the same (recipient, epoch).
    fn upsert_client_bloom_filter(&self, filter: ClientBloomFilter) -> HazeResult<()>;

    /// Filters for `recipient` whose covered interval intersects
    /// `[first_round, last_round]`.
    fn get_client_bloom_filters(
        &self,
        recipient: i64,
        first_round: u64,
        last_round: u64,
    ) -> HazeResult<Vec<ClientBloomFilter>>;

    fn delete_client_filters_before_epoch(&self, epoch: u32) -> HazeResult<()>;

    /// Records the epoch a round belongs to, for later garbage collection.
    fn insert_epoch(&self, round_id: u64, epoch: u32) -> HazeResult<()>;

    /// Drops epoch records older than `epoch` and returns the round ids they
    /// covered, so callers can purge dependent rows.
    fn delete_epochs_before(&self, epoch: u32) -> HazeResult<Vec<u64>>;
}
