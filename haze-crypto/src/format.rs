#![forbid(unsafe_code)]

//! Formatted cMix message layout.
//!
//! A message is two payload halves of equal width. Addressing metadata lives
//! at the head of payload B:
//!
//! ```text
//! B[0]        group-membership byte, always present
//! B[1..9]     ephemeral recipient identifier, big-endian
//! B[9..34]    identity fingerprint
//! ```
//!
//! The split into halves is a serialization artifact; storage keeps the
//! concatenation and recovers the halves by width.

use haze_core::ephemeral::{EphemeralId, EPHEMERAL_ID_LEN};
use haze_core::{HazeError, HazeResult};

/// Identity fingerprint width.
pub const IDENTITY_FP_LEN: usize = 25;
/// Offset of the ephemeral recipient identifier within payload B.
const RID_OFFSET: usize = 1;
const FP_OFFSET: usize = RID_OFFSET + EPHEMERAL_ID_LEN;
/// Minimum payload width able to carry the addressing header.
pub const MIN_PAYLOAD_LEN: usize = FP_OFFSET + IDENTITY_FP_LEN;

/// The all-zero fingerprint that identifies dummy messages.
pub const DUMMY_ID_FP: [u8; IDENTITY_FP_LEN] = [0u8; IDENTITY_FP_LEN];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    data: Vec<u8>,
    payload_len: usize,
}

impl Message {
    /// Zeroed message with the given per-half payload width.
    pub fn new(payload_len: usize) -> HazeResult<Self> {
        if payload_len < MIN_PAYLOAD_LEN {
            return Err(HazeError::Invalid(format!(
                "payload width {payload_len} below minimum {MIN_PAYLOAD_LEN}"
            )));
        }
        Ok(Message {
            data: vec![0u8; payload_len * 2],
            payload_len,
        })
    }

    /// Reassemble a message from its two wire halves.
    pub fn from_payloads(payload_a: &[u8], payload_b: &[u8]) -> HazeResult<Self> {
        if payload_a.len() != payload_b.len() || payload_a.len() < MIN_PAYLOAD_LEN {
            return Err(HazeError::Invalid(format!(
                "bad payload halves: {} and {} bytes",
                payload_a.len(),
                payload_b.len()
            )));
        }
        let mut data = Vec::with_capacity(payload_a.len() * 2);
        data.extend_from_slice(payload_a);
        data.extend_from_slice(payload_b);
        Ok(Message {
            payload_len: payload_a.len(),
            data,
        })
    }

    pub fn payload_a(&self) -> &[u8] {
        &self.data[..self.payload_len]
    }

    pub fn payload_b(&self) -> &[u8] {
        &self.data[self.payload_len..]
    }

    pub fn set_payload_a(&mut self, payload: &[u8]) -> HazeResult<()> {
        if payload.len() != self.payload_len {
            return Err(HazeError::Invalid("payload A width mismatch".into()));
        }
        self.data[..self.payload_len].copy_from_slice(payload);
        Ok(())
    }

    pub fn set_payload_b(&mut self, payload: &[u8]) -> HazeResult<()> {
        if payload.len() != self.payload_len {
            return Err(HazeError::Invalid("payload B width mismatch".into()));
        }
        self.data[self.payload_len..].copy_from_slice(payload);
        Ok(())
    }

    pub fn ephemeral_rid(&self) -> EphemeralId {
        let b = self.payload_b();
        // Width is enforced at construction.
        EphemeralId::from_bytes(&b[RID_OFFSET..RID_OFFSET + EPHEMERAL_ID_LEN])
            .unwrap_or_default()
    }

    pub fn set_ephemeral_rid(&mut self, rid: EphemeralId) {
        let start = self.payload_len + RID_OFFSET;
        self.data[start..start + EPHEMERAL_ID_LEN].copy_from_slice(&rid.to_bytes());
    }

    pub fn identity_fp(&self) -> &[u8] {
        &self.payload_b()[FP_OFFSET..FP_OFFSET + IDENTITY_FP_LEN]
    }

    pub fn set_identity_fp(&mut self, fp: &[u8; IDENTITY_FP_LEN]) {
        let start = self.payload_len + FP_OFFSET;
        self.data[start..start + IDENTITY_FP_LEN].copy_from_slice(fp);
    }

    pub fn is_dummy(&self) -> bool {
        self.identity_fp() == DUMMY_ID_FP
    }

    /// Full serialized contents, hashed for notification dispatch.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_round_trip() {
        let mut msg = Message::new(64).unwrap();
        msg.set_ephemeral_rid(EphemeralId::from_i64(77));
        msg.set_identity_fp(&[9u8; IDENTITY_FP_LEN]);

        assert_eq!(msg.ephemeral_rid().int64(), 77);
        assert_eq!(msg.identity_fp(), &[9u8; IDENTITY_FP_LEN]);
        assert!(!msg.is_dummy());
    }

    #[test]
    fn fresh_message_is_dummy() {
        let msg = Message::new(64).unwrap();
        assert!(msg.is_dummy());
    }

    #[test]
    fn halves_survive_reassembly() {
        let mut msg = Message::new(40).unwrap();
        msg.set_payload_a(&[1u8; 40]).unwrap();
        msg.set_ephemeral_rid(EphemeralId::from_i64(5));

        let rebuilt = Message::from_payloads(msg.payload_a(), msg.payload_b()).unwrap();
        assert_eq!(rebuilt, msg);
        assert_eq!(rebuilt.ephemeral_rid().int64(), 5);
    }

    #[test]
    fn rejects_undersized_payloads() {
        assert!(Message::new(8).is_err());
        assert!(Message::from_payloads(&[0; 40], &[0; 41]).is_err());
    }
}
