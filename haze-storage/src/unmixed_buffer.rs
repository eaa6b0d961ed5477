#![forbid(unsafe_code)]

//! Round-keyed in-memory batch builder for unmixed client messages.
//!
//! Slots stay FIFO within a round; there is no cross-round ordering. The
//! first writer for a round announces the batch size, which caps the batch
//! thereafter.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use haze_core::{HazeError, HazeResult};

use crate::models::{RoundBatch, Slot};

#[derive(Default)]
pub struct UnmixedBuffer {
    rounds: Mutex<BTreeMap<u64, RoundBatch>>,
}

impl UnmixedBuffer {
    pub fn new() -> Self {
        UnmixedBuffer::default()
    }

    /// Append one slot to the batch for `round_id`, opening the batch with
    /// `batch_size` when absent. Fails `Overfull` at capacity.
    pub fn add_unmixed_message(
        &self,
        slot: Slot,
        round_id: u64,
        batch_size: u32,
    ) -> HazeResult<()> {
        let mut rounds = self.rounds.lock();
        let batch = rounds.entry(round_id).or_insert_with(|| RoundBatch {
            round_id,
            from_phase: 0,
            batch_size,
            slots: Vec::new(),
        });
        if batch.slots.len() >= batch.batch_size as usize {
            return Err(HazeError::Overfull(format!(
                "round {round_id} already holds {} slots",
                batch.slots.len()
            )));
        }
        batch.slots.push(slot);
        Ok(())
    }

    /// Append many slots; all-or-nothing when any would overfill the batch.
    pub fn add_many_unmixed_messages(
        &self,
        slots: Vec<Slot>,
        round_id: u64,
        batch_size: u32,
    ) -> HazeResult<()> {
        let mut rounds = self.rounds.lock();
        let batch = rounds.entry(round_id).or_insert_with(|| RoundBatch {
            round_id,
            from_phase: 0,
            batch_size,
            slots: Vec::new(),
        });
        if batch.slots.len() + slots.len() > batch.batch_size as usize {
            return Err(HazeError::Overfull(format!(
                "round {round_id} cannot take {} more slots",
                slots.len()
            )));
        }
        batch.slots.extend(slots);
        Ok(())
    }

    /// Remove and return the batch for `round_id`. A second pop returns None.
    pub fn pop_round(&self, round_id: u64) -> Option<RoundBatch> {
        self.rounds.lock().remove(&round_id)
    }

    /// Number of buffered slots for `round_id`.
    pub fn len_unmixed(&self, round_id: u64) -> usize {
        self.rounds
            .lock()
            .get(&round_id)
            .map_or(0, |batch| batch.slots.len())
    }

    /// Drain between `min_count` and `max_count` slots, FIFO, from the oldest
    /// open round. Returns None without blocking when fewer than `min_count`
    /// are buffered there.
    pub fn pop_unmixed_messages(&self, min_count: usize, max_count: usize) -> Option<RoundBatch> {
        let mut rounds = self.rounds.lock();
        let (&round_id, batch) = rounds.iter_mut().next()?;
        if batch.slots.len() < min_count {
            return None;
        }
        let take = batch.slots.len().min(max_count);
        let popped = RoundBatch {
            round_id,
            from_phase: batch.from_phase,
            batch_size: batch.batch_size,
            slots: batch.slots.drain(..take).collect(),
        };
        if batch.slots.is_empty() {
            rounds.remove(&round_id);
        }
        Some(popped)
    }
}
