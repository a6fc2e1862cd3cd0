//! Crate-wide error taxonomy.
//!
//! `core` never uses `anyhow`: every fallible operation returns this enum so
//! callers (trust manager, sync controllers, CLI) can match on the kind
//! rather than downcast. `anyhow` lives only at the `cli` binary boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("operation attempted before start()")]
    NotStarted,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("pairing payload expired")]
    PairingExpired,

    #[error("pairing payload invalid: {0}")]
    PairingInvalid(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
