//! Data-channel handshake line.
//!
//! When the daemon opens a data channel for a download or upload it replies
//! on the control channel with a text line of the form:
//!
//! ```text
//! DATA_PORT <port> <path>
//! ```
//!
//! The client then connects to `<port>` on the daemon's address and streams
//! the file named by `<path>`.

use crate::error::{ProtocolError, Result};

/// Keyword opening the handshake line.
pub const DATA_PORT_KEYWORD: &str = "DATA_PORT";

/// Parsed data-channel handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelHandshake {
    /// TCP port the data channel listens on.
    pub port: u16,
    /// Path of the file being transferred, as the client named it.
    pub path: String,
}

impl DataChannelHandshake {
    /// Create a new handshake.
    pub fn new(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
        }
    }

    /// Format the handshake line.
    pub fn format(&self) -> String {
        format!("{} {} {}", DATA_PORT_KEYWORD, self.port, self.path)
    }

    /// Parse a handshake line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.trim_end().splitn(3, ' ');

        match parts.next() {
            Some(DATA_PORT_KEYWORD) => {}
            _ => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "handshake line does not start with {}: {:?}",
                    DATA_PORT_KEYWORD, line
                )))
            }
        }

        let port = parts
            .next()
            .ok_or_else(|| {
                ProtocolError::MalformedPayload("handshake line missing port".to_string())
            })?
            .parse::<u16>()
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid port: {}", e)))?;

        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ProtocolError::MalformedPayload("handshake line missing path".to_string())
            })?
            .to_string();

        Ok(Self { port, path })
    }
}
