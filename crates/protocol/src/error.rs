//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not enough bytes to decode a complete item.
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead {
        /// Bytes required for a complete item.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// Frame payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Header carries a message type discriminant we do not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    /// Broker request carries a command discriminant we do not know.
    #[error("unknown broker command: {0}")]
    UnknownCommand(u32),

    /// Payload bytes do not match the expected layout.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Underlying I/O failure not covered by a more specific variant.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
