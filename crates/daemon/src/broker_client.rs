//! Client side of the broker IPC.
//!
//! Each call opens a fresh connection to the broker socket, sends one
//! request and reads one response. The broker serves connections
//! concurrently, so this keeps the client free of multiplexing state and
//! mirrors the one-request-per-connection lifecycle the broker expects.

use std::path::PathBuf;
use std::time::Duration;

use protocol::{broker, BrokerRequest, BrokerResponse, ProtocolError};
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

/// Errors raised when calling the broker.
#[derive(Debug, Error)]
pub enum BrokerClientError {
    /// Could not connect to the broker socket.
    #[error("broker unreachable at {path}: {source}")]
    Unreachable {
        /// The socket path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The request did not complete in time.
    #[error("broker request timed out after {0:?}")]
    Timeout(Duration),

    /// Wire-level failure talking to the broker.
    #[error("broker protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for broker calls.
pub type Result<T> = std::result::Result<T, BrokerClientError>;

/// Connects to the broker socket per request.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl BrokerClient {
    /// Create a client for the given socket path and request timeout.
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    /// Send one request and wait for its response.
    pub async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        debug!(command = ?request.command, "Calling broker");

        let result = tokio::time::timeout(self.timeout, self.call_inner(request)).await;
        match result {
            Ok(response) => response,
            Err(_) => Err(BrokerClientError::Timeout(self.timeout)),
        }
    }

    /// Check that the broker answers on its socket.
    pub async fn probe(&self) -> Result<()> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| BrokerClientError::Unreachable {
                path: self.socket_path.clone(),
                source,
            })?;
        Ok(())
    }

    async fn call_inner(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|source| {
            BrokerClientError::Unreachable {
                path: self.socket_path.clone(),
                source,
            }
        })?;

        broker::write_request(&mut stream, &request).await?;
        let response = broker::read_response(&mut stream).await?;
        Ok(response)
    }
}
