#![forbid(unsafe_code)]

//! Deterministic junk slots used to pad an unmixed batch to its round's
//! batch size before upload.

use haze_core::ephemeral;
use haze_core::id::DUMMY_USER;
use haze_crypto::format::{Message, DUMMY_ID_FP};
use haze_crypto::hash;
use haze_storage::Slot;

/// Salt carried by every junk slot: 0x01 followed by zeros.
const JUNK_SALT_LEN: usize = 32;

/// Generate the junk slot for position `msg_num` of round `round_id`.
/// Deterministic in `(msg_num, round_id)`: padding two gateways for the same
/// round yields identical slots.
pub fn gen_junk_msg(payload_len: usize, num_nodes: usize, msg_num: u32, round_id: u64) -> Slot {
    let mut salt = vec![0u8; JUNK_SALT_LEN];
    salt[0] = 0x01;

    // The encoded counter cannot be zero and starts past the group byte, so
    // the payload stays inside the cyclic group.
    let mut payload = vec![0u8; payload_len];
    payload[1..5].copy_from_slice(&(msg_num + 1).to_le_bytes());

    let mut msg = Message::new(payload_len).expect("payload width checked at startup");
    msg.set_payload_a(&payload).expect("width matches");
    msg.set_payload_b(&payload).expect("width matches");

    // Address the dummy user deterministically; the round id stands in for
    // the rotation clock so regenerated padding matches.
    let eph = ephemeral::get_id(&DUMMY_USER, 64, round_id as i64).expect("valid address space");
    msg.set_ephemeral_rid(eph);
    msg.set_identity_fp(&DUMMY_ID_FP);

    let kmacs = (0..num_nodes as u32)
        .map(|i| hash::junk_kmac(DUMMY_USER.as_bytes(), &salt, round_id, i))
        .collect();

    Slot {
        sender_id: DUMMY_USER,
        payload_a: msg.payload_a().to_vec(),
        payload_b: msg.payload_b().to_vec(),
        salt,
        kmacs,
        mac: Vec::new(),
    }
}
