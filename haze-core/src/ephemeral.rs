#![forbid(unsafe_code)]

//! Ephemeral recipient identifiers.
//!
//! Recipients are addressed by a signed 64-bit identifier derived from their
//! long-term user [`Id`], the network's current address-space size in bits,
//! and a rotation window. On the wire the identifier is padded with random
//! high bits; [`EphemeralId::clear`] masks those off, keeping only the low
//! `address_space_size` bits. A cleared value of zero denotes a dummy and is
//! never stored or gossiped.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HazeError, HazeResult};
use crate::id::Id;

/// Wire width of an ephemeral identifier.
pub const EPHEMERAL_ID_LEN: usize = 8;

/// Identifier rotation window.
const ROTATION_PERIOD_NANOS: i64 = 24 * 60 * 60 * 1_000_000_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct EphemeralId(i64);

impl EphemeralId {
    pub fn from_i64(v: i64) -> Self {
        EphemeralId(v)
    }

    /// Parse the big-endian wire form. Fails `Invalid` on bad length.
    pub fn from_bytes(bytes: &[u8]) -> HazeResult<Self> {
        let raw: [u8; EPHEMERAL_ID_LEN] = bytes.try_into().map_err(|_| {
            HazeError::Invalid(format!(
                "ephemeral id must be {EPHEMERAL_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(EphemeralId(i64::from_be_bytes(raw)))
    }

    pub fn to_bytes(self) -> [u8; EPHEMERAL_ID_LEN] {
        self.0.to_be_bytes()
    }

    pub fn int64(self) -> i64 {
        self.0
    }

    /// Mask off everything above the low `address_space_size` bits.
    #[must_use]
    pub fn clear(self, address_space_size: u8) -> EphemeralId {
        if address_space_size == 0 {
            return EphemeralId(0);
        }
        if address_space_size >= 64 {
            return self;
        }
        let mask = u64::MAX >> (64 - u32::from(address_space_size));
        EphemeralId((self.0 as u64 & mask) as i64)
    }

    /// A cleared identifier of zero addresses nobody.
    pub fn is_dummy(self) -> bool {
        self.0 == 0
    }
}

/// Derive the ephemeral identifier for `user` in the rotation window that
/// contains `now_nanos`. Deterministic for a fixed (user, size, window).
pub fn get_id(user: &Id, address_space_size: u8, now_nanos: i64) -> HazeResult<EphemeralId> {
    if address_space_size == 0 || address_space_size > 64 {
        return Err(HazeError::Invalid(format!(
            "address space size {address_space_size} out of range"
        )));
    }
    let window = now_nanos.div_euclid(ROTATION_PERIOD_NANOS);

    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([address_space_size]);
    hasher.update(window.to_le_bytes());
    let digest = hasher.finalize();

    let mut raw = [0u8; EPHEMERAL_ID_LEN];
    raw.copy_from_slice(&digest[..EPHEMERAL_ID_LEN]);
    Ok(EphemeralId(i64::from_be_bytes(raw)).clear(address_space_size))
}
