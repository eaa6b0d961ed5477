#![forbid(unsafe_code)]

//! Signed-payload gossip overlay.
//!
//! Two independent channels replicate per-round summaries across sibling
//! gateways: sender summaries drive rate-limit credits, recipient summaries
//! drive bloom-filter upserts. Every envelope is RSA-signed over
//! `tag ‖ origin ‖ payload` and verified against the origin's published key
//! and the round topology before it is applied.

pub mod manager;
pub mod message;
pub mod protocol;

pub use manager::{Manager, ManagerFlags};
pub use message::{GossipMessage, RoundIdsPayload, BLOOM_FILTER_TAG, RATE_LIMIT_TAG};
pub use protocol::{GossipTransport, Protocol, ProtocolFlags};
