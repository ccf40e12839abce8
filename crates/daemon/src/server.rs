//! TCP accept loop.
//!
//! One supervised task per connection; a failing connection logs and dies
//! on its own, the listener keeps accepting. The connection count is
//! bounded by a semaphore sized from the configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::Message;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::broker_client::BrokerClient;
use crate::config::Config;
use crate::connection::Connection;
use crate::registry::SharedRegistry;

/// Errors raised by the server itself (not per-connection failures).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Accept loop failed.
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// The public-facing daemon server.
pub struct Server {
    listener: TcpListener,
    registry: Arc<SharedRegistry>,
    broker_socket: PathBuf,
    broker_timeout: Duration,
    data_bind_addr: String,
    transfer_wait: Duration,
    clients: Arc<Semaphore>,
}

impl Server {
    /// Bind the listener and assemble the shared state from the config.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;

        info!(addr = %addr, max_clients = config.server.max_clients, "Server listening");

        Ok(Self {
            listener,
            registry: Arc::new(SharedRegistry::new(
                config.registry.max_users,
                config.registry.max_transfers,
            )),
            broker_socket: config.broker.socket_path.clone(),
            broker_timeout: Duration::from_secs(config.broker.request_timeout_secs),
            data_bind_addr: config.server.bind_addr.clone(),
            transfer_wait: Duration::from_secs(config.registry.transfer_wait_secs),
            clients: Arc::new(Semaphore::new(config.server.max_clients)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// The shared registry, for inspection.
    pub fn registry(&self) -> Arc<SharedRegistry> {
        self.registry.clone()
    }

    /// Run the accept loop until the task is cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (mut stream, peer) = self.listener.accept().await.map_err(ServerError::Accept)?;

            let Ok(permit) = self.clients.clone().try_acquire_owned() else {
                warn!(peer = %peer, "Connection limit reached, turning client away");
                tokio::spawn(async move {
                    let busy = Message::error("Server busy: Too many connections");
                    let _ = protocol::write_message(&mut stream, &busy).await;
                });
                continue;
            };

            let connection = Connection::new(
                stream,
                peer,
                self.registry.clone(),
                BrokerClient::new(self.broker_socket.clone(), self.broker_timeout),
                self.data_bind_addr.clone(),
                self.transfer_wait,
            );
            tokio::spawn(async move {
                if let Err(e) = connection.run().await {
                    warn!(peer = %peer, error = %e, "Connection failed");
                }
                drop(permit);
            });
        }
    }
}
