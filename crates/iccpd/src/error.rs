//! Error types for iccpd

use thiserror::Error;

/// Errors that can occur in the ICCP engine.
///
/// Nothing in this taxonomy is allowed to terminate the process: callers
/// degrade to a negative acknowledgment, a forced resynchronization
/// request, or a full session reset.
#[derive(Debug, Error)]
pub enum IccpError {
    /// Encode buffer cannot hold the computed message length
    #[error("encode buffer too small: need {needed} octets, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// Received parameter would read past the buffer end, or carries
    /// an impossible length/type combination
    #[error("malformed TLV: {0}")]
    MalformedTlv(String),

    /// Peer socket unavailable or broken
    #[error("transport fault: {0}")]
    Transport(String),

    /// Non-blocking send could not complete; retry on a later tick
    #[error("send would block")]
    SendBlocked,

    /// Configuration file missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for iccpd operations
pub type Result<T> = std::result::Result<T, IccpError>;
