#![forbid(unsafe_code)]

//! Compressed set of rounds this gateway has processed or learned of via
//! gossip. Persisted so restarts do not forget history.
//!
//! Representation: a base round offset plus a bitmap. Fully-known leading
//! bytes are folded into the offset on every mutation, which keeps the bitmap
//! proportional to the width of the in-flight window rather than the age of
//! the network.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HazeError, HazeResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnownRounds {
    /// Every round below this is known.
    first: u64,
    /// Bit i covers round `first + i`.
    bits: Vec<u8>,
}

impl KnownRounds {
    pub fn new() -> Self {
        KnownRounds::default()
    }

    /// Mark a round as known.
    pub fn check(&mut self, round: u64) {
        if round < self.first {
            return;
        }
        let idx = (round - self.first) as usize;
        let byte = idx / 8;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (idx % 8);
        self.compress();
    }

    /// Whether a round has been marked.
    pub fn checked(&self, round: u64) -> bool {
        if round < self.first {
            return true;
        }
        let idx = (round - self.first) as usize;
        self.bits
            .get(idx / 8)
            .is_some_and(|b| b & (1 << (idx % 8)) != 0)
    }

    fn compress(&mut self) {
        let full = self.bits.iter().take_while(|&&b| b == 0xff).count();
        if full > 0 {
            self.bits.drain(..full);
            self.first += (full * 8) as u64;
        }
    }

    pub fn save(&self, path: &Path) -> HazeResult<()> {
        let data = serde_cbor::to_vec(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn load(path: &Path) -> HazeResult<Self> {
        let data = fs::read(path)?;
        serde_cbor::from_slice(&data).map_err(HazeError::from)
    }
}
