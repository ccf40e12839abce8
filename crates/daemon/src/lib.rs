//! # RemoVault Daemon Library
//!
//! The public-facing service of RemoVault: accepts client connections over
//! TCP, authenticates them as system users, and mediates every filesystem
//! operation through the privileged broker process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Server                           │
//! ├─────────────────────────────────────────────────────────┤
//! │                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │  │  Connection  │  │  Connection  │  │  Connection  │   │
//! │  │  Dispatcher  │  │  Dispatcher  │  │  Dispatcher  │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘   │
//! │         │                 │                 │           │
//! │  ┌──────┴─────────────────┴─────────────────┴───────┐   │
//! │  │        Shared Registry (users + transfers)       │   │
//! │  └──────────────────────────────────────────────────┘   │
//! │                                                         │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │    Broker Client (Unix socket to the broker)     │   │
//! │  └──────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection runs in its own task with its own [`dispatcher`] state
//! machine. Transfers between users flow through the [`registry`] and are
//! announced over per-user [`notify`] channels; bulk file bytes bypass the
//! control connection entirely via [`datachannel`] sockets.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, validation, env overrides
//! - [`server`]: TCP accept loop and connection limits
//! - [`connection`]: Per-connection read/dispatch/notify loop
//! - [`dispatcher`]: Command parsing and routing
//! - [`session`]: Per-connection authentication state
//! - [`registry`]: Shared table of online users and transfer tickets
//! - [`notify`]: Transfer event channels and notification text
//! - [`datachannel`]: Out-of-band sockets for downloads and uploads
//! - [`broker_client`]: IPC client for the privileged broker

pub mod broker_client;
pub mod config;
pub mod connection;
pub mod datachannel;
pub mod dispatcher;
pub mod notify;
pub mod registry;
pub mod server;
pub mod session;

pub use broker_client::BrokerClient;
pub use config::Config;
pub use connection::Connection;
pub use dispatcher::Dispatcher;
pub use registry::SharedRegistry;
pub use server::Server;
pub use session::ClientSession;
