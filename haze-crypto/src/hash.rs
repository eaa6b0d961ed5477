#![forbid(unsafe_code)]

//! The cMix hash (BLAKE2b-256) and the constructions built on it: the slot
//! digest, the per-client message MAC, and the notification message hash.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha2::Sha256;

type Blake2b256 = Blake2b<U32>;

/// Hash width of the cMix hash.
pub const CMIX_HASH_LEN: usize = 32;

/// One-shot cMix hash over concatenated inputs.
pub fn cmix_hash(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Digest over the authenticated fields of a gateway slot, in wire order,
/// bound to the round the slot was submitted for.
pub fn slot_digest(
    sender_id: &[u8],
    payload_a: &[u8],
    payload_b: &[u8],
    salt: &[u8],
    kmacs: &[Vec<u8>],
    round_id: u64,
) -> Vec<u8> {
    let mut hasher = Blake2b256::new();
    hasher.update(sender_id);
    hasher.update(payload_a);
    hasher.update(payload_b);
    hasher.update(salt);
    for kmac in kmacs {
        hasher.update(kmac);
    }
    hasher.update(round_id.to_le_bytes());
    hasher.finalize().to_vec()
}

/// Client authentication MAC: `H(H(key ‖ salt) ‖ slot_digest)`.
pub fn client_mac(key: &[u8], salt: &[u8], slot_digest: &[u8]) -> Vec<u8> {
    let inner = cmix_hash(&[key, salt]);
    cmix_hash(&[&inner, slot_digest])
}

/// Per-node KMAC for a deterministic junk slot.
pub fn junk_kmac(base_key: &[u8], salt: &[u8], round_id: u64, node_index: u32) -> Vec<u8> {
    cmix_hash(&[
        base_key,
        salt,
        &round_id.to_le_bytes(),
        &node_index.to_le_bytes(),
    ])
}

/// Hash of message contents shipped to the notification dispatcher.
pub fn message_hash(contents: &[u8]) -> Vec<u8> {
    Sha256::digest(contents).to_vec()
}
