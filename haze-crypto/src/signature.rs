#![forbid(unsafe_code)]

//! RSA signatures over SHA-256, used for gossip envelopes and for
//! countersigning the node's key responses, plus the hash-based construction
//! that derives a user identifier from a registration key.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::sha2::{Digest, Sha256};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

use haze_core::id::{Id, IdKind, ID_LEN};
use haze_core::{HazeError, HazeResult};

use crate::hash::cmix_hash;

/// Key width for generated identities.
pub const KEY_BITS: usize = 2048;

/// Sign `data` with PKCS#1 v1.5 over its SHA-256 digest.
pub fn sign(key: &RsaPrivateKey, data: &[u8]) -> HazeResult<Vec<u8>> {
    let digest = Sha256::digest(data);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| HazeError::Internal(format!("rsa signing failed: {e}")))
}

/// Verify a PKCS#1 v1.5 signature over the SHA-256 digest of `data`.
pub fn verify(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> HazeResult<()> {
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| HazeError::Unauthenticated("bad signature".into()))
}

/// Generate a fresh keypair; dev mode and tests only.
pub fn generate_keypair() -> HazeResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, KEY_BITS)
        .map_err(|e| HazeError::Internal(format!("keygen failed: {e}")))
}

/// Load a private key from PEM, accepting PKCS#8 or PKCS#1 encodings.
pub fn private_key_from_pem(pem: &str) -> HazeResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| HazeError::Invalid(format!("unreadable private key: {e}")))
}

/// Load a public key from PEM, accepting SPKI or PKCS#1 encodings.
pub fn public_key_from_pem(pem: &str) -> HazeResult<RsaPublicKey> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| HazeError::Invalid(format!("unreadable public key: {e}")))
}

/// PEM form of a public key, as published in the network definition.
pub fn public_key_to_pem(key: &RsaPublicKey) -> HazeResult<String> {
    use rsa::pkcs8::EncodePublicKey;
    key.to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| HazeError::Internal(format!("public key encoding failed: {e}")))
}

/// DER form of a public key, the input to user-identifier derivation.
pub fn public_key_der(key: &RsaPublicKey) -> HazeResult<Vec<u8>> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| HazeError::Internal(format!("public key encoding failed: {e}")))
}

/// Derive a user identifier from a registration public key and salt.
pub fn user_id_from_key(pubkey_der: &[u8], salt: &[u8]) -> Id {
    let digest = cmix_hash(&[pubkey_der, salt]);
    let mut data = [0u8; ID_LEN - 1];
    data.copy_from_slice(&digest[..ID_LEN - 1]);
    Id::new(data, IdKind::User)
}
