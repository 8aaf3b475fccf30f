//! Error types for anywake

use thiserror::Error;

use crate::devices::DeviceField;
use crate::peer::PeerId;

/// Result type alias for anywake operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in anywake
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Mutation or lookup on a device the registry does not hold
    #[error("device not found: {0}")]
    NotFound(String),

    /// Field that callers are not allowed to set directly
    #[error("field is read-only: {0}")]
    ReadOnlyField(DeviceField),

    /// Change rejected by validation (bad MAC, empty name, ...)
    #[error("invalid change: {0}")]
    InvalidChange(String),

    /// No active session with the peer
    #[error("peer unreachable: {0}")]
    Unreachable(PeerId),

    /// Wake correlation window elapsed
    #[error("timed out waiting for {0}")]
    TimedOut(String),

    /// The wake transport itself failed
    #[error("wake capability failed: {0}")]
    CapabilityFailed(String),

    /// Pending operation abandoned because the node shut down
    #[error("operation cancelled")]
    Cancelled,

    /// Peer protocol violation (bad handshake, unexpected frame)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Durable storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
