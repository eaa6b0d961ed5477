#![forbid(unsafe_code)]

//! Fixed-parameter bloom filter over round identifiers.
//!
//! Clients and gateways must agree bit-for-bit on the filter layout, so the
//! parameters are constants and the hash family is derived from SHA-256 with
//! an index byte. Per-epoch filters for the same recipient are merged by
//! bitwise OR, which this representation supports trivially.

use sha2::{Digest, Sha256};

/// Filter width in bits.
pub const FILTER_BITS: usize = 648;
/// Number of hash functions.
pub const FILTER_HASHES: usize = 10;
/// Serialized width in bytes.
pub const FILTER_LEN: usize = FILTER_BITS.div_ceil(8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundFilter {
    bits: [u8; FILTER_LEN],
}

impl Default for RoundFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundFilter {
    pub fn new() -> Self {
        RoundFilter {
            bits: [0u8; FILTER_LEN],
        }
    }

    fn positions(round_id: u64) -> impl Iterator<Item = usize> {
        (0..FILTER_HASHES as u8).map(move |i| {
            let mut hasher = Sha256::new();
            hasher.update(round_id.to_le_bytes());
            hasher.update([i]);
            let digest = hasher.finalize();
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest[..8]);
            (u64::from_be_bytes(raw) % FILTER_BITS as u64) as usize
        })
    }

    pub fn add(&mut self, round_id: u64) {
        for pos in Self::positions(round_id) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    pub fn contains(&self, round_id: u64) -> bool {
        Self::positions(round_id).all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_after_add() {
        let mut f = RoundFilter::new();
        f.add(42);
        assert!(f.contains(42));
        assert!(!f.contains(43));
    }

    #[test]
    fn deterministic_bits() {
        let mut a = RoundFilter::new();
        let mut b = RoundFilter::new();
        a.add(1000);
        b.add(1000);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn serialized_width_is_fixed() {
        let f = RoundFilter::new();
        assert_eq!(f.as_bytes().len(), FILTER_LEN);
    }
}
