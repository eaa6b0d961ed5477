#![forbid(unsafe_code)]

//! Durable store backing on sled: one tree per table, CBOR-encoded rows,
//! batch-applied writes where the interface demands atomicity.

use parking_lot::Mutex;
use sled::{Batch, Db, Tree};

use haze_core::ephemeral::EphemeralId;
use haze_core::id::Id;
use haze_core::rounds::Round;
use haze_core::{HazeError, HazeResult};

use crate::models::{Client, ClientBloomFilter, ClientRound, MixedMessage};
use crate::store::Database;

pub struct SledImpl {
    db: Db,
    clients: Tree,
    rounds: Tree,
    mixed: Tree,
    filters: Tree,
    epochs: Tree,
    /// Serializes read-modify-write upserts; everything else is single-key.
    write_lock: Mutex<()>,
}

fn backend(e: impl std::fmt::Display) -> HazeError {
    HazeError::Backend(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> HazeResult<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(backend)
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> HazeResult<T> {
    serde_cbor::from_slice(raw).map_err(backend)
}

fn mixed_key(round_id: u64, recipient: EphemeralId, message_id: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&round_id.to_be_bytes());
    key[8..16].copy_from_slice(&recipient.to_bytes());
    key[16..].copy_from_slice(&message_id.to_be_bytes());
    key
}

fn filter_key(recipient: i64, epoch: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&recipient.to_be_bytes());
    key[8..].copy_from_slice(&epoch.to_be_bytes());
    key
}

fn epoch_key(epoch: u32, round_id: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&epoch.to_be_bytes());
    key[4..].copy_from_slice(&round_id.to_be_bytes());
    key
}

impl SledImpl {
    pub fn open(path: &std::path::Path) -> HazeResult<Self> {
        let db = sled::open(path).map_err(backend)?;
        Ok(SledImpl {
            clients: db.open_tree("clients").map_err(backend)?,
            rounds: db.open_tree("rounds").map_err(backend)?,
            mixed: db.open_tree("mixed_messages").map_err(backend)?,
            filters: db.open_tree("bloom_filters").map_err(backend)?,
            epochs: db.open_tree("epochs").map_err(backend)?,
            write_lock: Mutex::new(()),
            db,
        })
    }

    fn next_message_id(&self) -> HazeResult<u64> {
        // Sled ids start at 0; message id 0 means "unassigned".
        Ok(self.db.generate_id().map_err(backend)? + 1)
    }
}

impl Database for SledImpl {
    fn insert_client(&self, client: Client) -> HazeResult<()> {
        let _guard = self.write_lock.lock();
        let key = client.id.to_vec();
        if self.clients.contains_key(&key).map_err(backend)? {
            return Err(HazeError::AlreadyExists(format!("client {}", client.id)));
        }
        self.clients.insert(key, encode(&client)?).map_err(backend)?;
        Ok(())
    }

    fn upsert_client(&self, client: Client) -> HazeResult<()> {
        self.clients
            .insert(client.id.to_vec(), encode(&client)?)
            .map_err(backend)?;
        Ok(())
    }

    fn get_client(&self, id: &Id) -> HazeResult<Client> {
        match self.clients.get(id.to_vec()).map_err(backend)? {
            Some(raw) => decode(&raw),
            None => Err(HazeError::NotFound(format!("client {id}"))),
        }
    }

    fn upsert_round(&self, round: Round) -> HazeResult<()> {
        let _guard = self.write_lock.lock();
        let key = round.id.to_be_bytes();
        if let Some(raw) = self.rounds.get(key).map_err(backend)? {
            let stored: Round = decode(&raw)?;
            if stored.update_id >= round.update_id {
                return Ok(());
            }
        }
        self.rounds.insert(key, encode(&round)?).map_err(backend)?;
        Ok(())
    }

    fn get_round(&self, id: u64) -> HazeResult<Round> {
        match self.rounds.get(id.to_be_bytes()).map_err(backend)? {
            Some(raw) => decode(&raw),
            None => Err(HazeError::NotFound(format!("round {id}"))),
        }
    }

    fn get_rounds(&self, ids: &[u64]) -> HazeResult<Vec<Round>> {
        let mut found = Vec::new();
        for id in ids {
            if let Some(raw) = self.rounds.get(id.to_be_bytes()).map_err(backend)? {
                found.push(decode(&raw)?);
            }
        }
        if found.is_empty() {
            return Err(HazeError::NotFound(format!("none of {} rounds", ids.len())));
        }
        Ok(found)
    }

    fn insert_mixed_messages(&self, round: &ClientRound) -> HazeResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = Batch::default();
        for message in &round.messages {
            let mut message = message.clone();
            if message.id == 0 {
                message.id = self.next_message_id()?;
            }
            let key = mixed_key(message.round_id, message.recipient_id, message.id);
            if self.mixed.contains_key(key).map_err(backend)? {
                return Err(HazeError::AlreadyExists(format!(
                    "mixed message {} in round {} for {}",
                    message.id,
                    message.round_id,
                    message.recipient_id.int64()
                )));
            }
            batch.insert(key.to_vec(), encode(&message)?);
        }
        self.mixed.apply_batch(batch).map_err(backend)?;
        Ok(())
    }

    fn get_mixed_messages(
        &self,
        recipient: EphemeralId,
        round_id: u64,
    ) -> HazeResult<Vec<MixedMessage>> {
        let mut prefix = [0u8; 16];
        prefix[..8].copy_from_slice(&round_id.to_be_bytes());
        prefix[8..].copy_from_slice(&recipient.to_bytes());

        let mut found = Vec::new();
        for item in self.mixed.scan_prefix(prefix) {
            let (_, raw) = item.map_err(backend)?;
            found.push(decode(&raw)?);
        }
        Ok(found)
    }

    fn count_mixed_messages_by_round(&self, round_id: u64) -> HazeResult<u64> {
        let mut count = 0u64;
        for item in self.mixed.scan_prefix(round_id.to_be_bytes()) {
            item.map_err(backend)?;
            count += 1;
        }
        Ok(count)
    }

    fn delete_mixed_messages_by_round(&self, round_id: u64) -> HazeResult<()> {
        let keys: Vec<_> = self
            .mixed
            .scan_prefix(round_id.to_be_bytes())
            .keys()
            .collect::<Result<_, _>>()
            .map_err(backend)?;
        let mut batch = Batch::default();
        for key in keys {
            batch.remove(key);
        }
        self.mixed.apply_batch(batch).map_err(backend)?;
        Ok(())
    }

    fn upsert_client_bloom_filter(&self, filter: ClientBloomFilter) -> HazeResult<()> {
        let _guard = self.write_lock.lock();
        let key = filter_key(filter.recipient_id, filter.epoch);
        let merged = match self.filters.get(key).map_err(backend)? {
            Some(raw) => {
                let mut stored: ClientBloomFilter = decode(&raw)?;
                stored.combine(&filter);
                stored
            }
            None => filter,
        };
        self.filters.insert(key, encode(&merged)?).map_err(backend)?;
        Ok(())
    }

    fn get_client_bloom_filters(
        &self,
        recipient: i64,
        first_round: u64,
        last_round: u64,
    ) -> HazeResult<Vec<ClientBloomFilter>> {
        let mut found = Vec::new();
        for item in self.filters.scan_prefix(recipient.to_be_bytes()) {
            let (_, raw) = item.map_err(backend)?;
            let filter: ClientBloomFilter = decode(&raw)?;
            if filter.intersects(first_round, last_round) {
                found.push(filter);
            }
        }
        Ok(found)
    }

    fn delete_client_filters_before_epoch(&self, epoch: u32) -> HazeResult<()> {
        let mut batch = Batch::default();
        for item in self.filters.iter() {
            let (key, raw) = item.map_err(backend)?;
            let filter: ClientBloomFilter = decode(&raw)?;
            if filter.epoch < epoch {
                batch.remove(key);
            }
        }
        self.filters.apply_batch(batch).map_err(backend)?;
        Ok(())
    }

    fn insert_epoch(&self, round_id: u64, epoch: u32) -> HazeResult<()> {
        self.epochs
            .insert(epoch_key(epoch, round_id), Vec::<u8>::new())
            .map_err(backend)?;
        Ok(())
    }

    fn delete_epochs_before(&self, epoch: u32) -> HazeResult<Vec<u64>> {
        let mut rounds = Vec::new();
        let mut batch = Batch::default();
        for item in self.epochs.range(..epoch_key(epoch, 0).to_vec()) {
            let (key, _) = item.map_err(backend)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&key[4..]);
            rounds.push(u64::from_be_bytes(raw));
            batch.remove(key);
        }
        self.epochs.apply_batch(batch).map_err(backend)?;
        Ok(rounds)
    }
}
