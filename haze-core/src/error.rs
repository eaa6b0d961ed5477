#![forbid(unsafe_code)]

//! Common error type for haze crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HazeError {
    /// Malformed input from a caller or the wire.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity being inserted is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// MAC mismatch or signature verification failure.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Sender exceeded its leaky bucket.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A round batch cannot accept more slots.
    #[error("buffer overfull: {0}")]
    Overfull(String),

    /// Proxy target is unknown to the host table.
    #[error("no such target: {0}")]
    NoTarget(String),

    /// Proxy target is known but has no live connection.
    #[error("target not connected: {0}")]
    NotConnected(String),

    /// An outbound operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Storage or I/O backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(toml::de::Error),

    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

/// Convenient alias for results throughout haze crates.
pub type HazeResult<T> = Result<T, HazeError>;
