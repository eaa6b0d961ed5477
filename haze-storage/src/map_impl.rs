#![forbid(unsafe_code)]

//! In-memory store backing. Exists for tests and dev mode; behavior matches
//! the sled backing apart from durability.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use haze_core::ephemeral::EphemeralId;
use haze_core::id::Id;
use haze_core::rounds::Round;
use haze_core::{HazeError, HazeResult};

use crate::models::{Client, ClientBloomFilter, ClientRound, MixedMessage};
use crate::store::Database;

type MessagesByRound = HashMap<u64, HashMap<EphemeralId, BTreeMap<u64, MixedMessage>>>;
type MessagesByRecipient = HashMap<EphemeralId, HashMap<u64, BTreeMap<u64, MixedMessage>>>;

#[derive(Default)]
struct MapInner {
    clients: HashMap<Id, Client>,
    rounds: HashMap<u64, Round>,
    by_round: MessagesByRound,
    by_recipient: MessagesByRecipient,
    round_counts: HashMap<u64, u64>,
    next_message_id: u64,
    filters: HashMap<(i64, u32), ClientBloomFilter>,
    epochs: BTreeMap<u32, Vec<u64>>,
}

#[derive(Default)]
pub struct MapImpl {
    inner: Mutex<MapInner>,
}

impl MapImpl {
    pub fn new() -> Self {
        MapImpl::default()
    }
}

impl Database for MapImpl {
    fn insert_client(&self, client: Client) -> HazeResult<()> {
        let mut inner = self.inner.lock();
        if inner.clients.contains_key(&client.id) {
            return Err(HazeError::AlreadyExists(format!("client {}", client.id)));
        }
        inner.clients.insert(client.id, client);
        Ok(())
    }

    fn upsert_client(&self, client: Client) -> HazeResult<()> {
        self.inner.lock().clients.insert(client.id, client);
        Ok(())
    }

    fn get_client(&self, id: &Id) -> HazeResult<Client> {
        self.inner
            .lock()
            .clients
            .get(id)
            .cloned()
            .ok_or_else(|| HazeError::NotFound(format!("client {id}")))
    }

    fn upsert_round(&self, round: Round) -> HazeResult<()> {
        let mut inner = self.inner.lock();
        match inner.rounds.get(&round.id) {
            Some(stored) if stored.update_id >= round.update_id => Ok(()),
            _ => {
                inner.rounds.insert(round.id, round);
                Ok(())
            }
        }
    }

    fn get_round(&self, id: u64) -> HazeResult<Round> {
        self.inner
            .lock()
            .rounds
            .get(&id)
            .cloned()
            .ok_or_else(|| HazeError::NotFound(format!("round {id}")))
    }

    fn get_rounds(&self, ids: &[u64]) -> HazeResult<Vec<Round>> {
        let inner = self.inner.lock();
        let found: Vec<Round> = ids
            .iter()
            .filter_map(|id| inner.rounds.get(id).cloned())
            .collect();
        if found.is_empty() {
            return Err(HazeError::NotFound(format!("none of {} rounds", ids.len())));
        }
        Ok(found)
    }

    fn insert_mixed_messages(&self, round: &ClientRound) -> HazeResult<()> {
        let mut inner = self.inner.lock();

        // Assign ids up front, then check for collisions before mutating so
        // the insert stays all-or-nothing.
        let mut prepared = Vec::with_capacity(round.messages.len());
        for message in &round.messages {
            let mut message = message.clone();
            if message.id == 0 {
                inner.next_message_id += 1;
                message.id = inner.next_message_id;
            }
            let exists = inner
                .by_round
                .get(&message.round_id)
                .and_then(|per_recipient| per_recipient.get(&message.recipient_id))
                .is_some_and(|per_id| per_id.contains_key(&message.id));
            if exists {
                return Err(HazeError::AlreadyExists(format!(
                    "mixed message {} in round {} for {}",
                    message.id,
                    message.round_id,
                    message.recipient_id.int64()
                )));
            }
            prepared.push(message);
        }

        for message in prepared {
            inner
                .by_round
                .entry(message.round_id)
                .or_default()
                .entry(message.recipient_id)
                .or_default()
                .insert(message.id, message.clone());
            inner
                .by_recipient
                .entry(message.recipient_id)
                .or_default()
                .entry(message.round_id)
                .or_default()
                .insert(message.id, message.clone());
            *inner.round_counts.entry(message.round_id).or_default() += 1;
        }
        Ok(())
    }

    fn get_mixed_messages(
        &self,
        recipient: EphemeralId,
        round_id: u64,
    ) -> HazeResult<Vec<MixedMessage>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_recipient
            .get(&recipient)
            .and_then(|per_round| per_round.get(&round_id))
            .map(|per_id| per_id.values().cloned().collect())
            .unwrap_or_default())
    }

    fn count_mixed_messages_by_round(&self, round_id: u64) -> HazeResult<u64> {
        Ok(self
            .inner
            .lock()
            .round_counts
            .get(&round_id)
            .copied()
            .unwrap_or(0))
    }

    fn delete_mixed_messages_by_round(&self, round_id: u64) -> HazeResult<()> {
        let mut inner = self.inner.lock();
        inner.by_round.remove(&round_id);
        for per_round in inner.by_recipient.values_mut() {
            per_round.remove(&round_id);
        }
        inner.by_recipient.retain(|_, per_round| !per_round.is_empty());
        inner.round_counts.remove(&round_id);
        Ok(())
    }

    fn upsert_client_bloom_filter(&self, filter: ClientBloomFilter) -> HazeResult<()> {
        let mut inner = self.inner.lock();
        let key = (filter.recipient_id, filter.epoch);
        match inner.filters.get_mut(&key) {
            Some(stored) => stored.combine(&filter),
            None => {
                inner.filters.insert(key, filter);
            }
        }
        Ok(())
    }

    fn get_client_bloom_filters(
        &self,
        recipient: i64,
        first_round: u64,
        last_round: u64,
    ) -> HazeResult<Vec<ClientBloomFilter>> {
        let inner = self.inner.lock();
        let mut found: Vec<ClientBloomFilter> = inner
            .filters
            .values()
            .filter(|f| f.recipient_id == recipient && f.intersects(first_round, last_round))
            .cloned()
            .collect();
        found.sort_by_key(|f| f.epoch);
        Ok(found)
    }

    fn delete_client_filters_before_epoch(&self, epoch: u32) -> HazeResult<()> {
        self.inner.lock().filters.retain(|(_, e), _| *e >= epoch);
        Ok(())
    }

    fn insert_epoch(&self, round_id: u64, epoch: u32) -> HazeResult<()> {
        self.inner.lock().epochs.entry(epoch).or_default().push(round_id);
        Ok(())
    }

    fn delete_epochs_before(&self, epoch: u32) -> HazeResult<Vec<u64>> {
        let mut inner = self.inner.lock();
        let keep = inner.epochs.split_off(&epoch);
        let expired = std::mem::replace(&mut inner.epochs, keep);
        Ok(expired.into_values().flatten().collect())
    }
}
