//! # RemoVault Broker
//!
//! The broker is the privileged half of RemoVault: it owns the storage
//! root, the system account database and all filesystem access. The daemon
//! never touches user files directly; it sends every operation here over a
//! Unix domain socket.
//!
//! ## Modules
//!
//! - [`sandbox`]: confinement contexts for path validation
//! - [`locks`]: per-path advisory reader/writer locks
//! - [`accounts`]: account provisioning behind the [`accounts::AccountStore`] trait
//! - [`fsops`]: confined filesystem operations
//! - [`service`]: the IPC service loop

pub mod accounts;
pub mod fsops;
pub mod locks;
pub mod sandbox;
pub mod service;

pub use accounts::{AccountIdentity, AccountStore, MemoryAccounts, SystemAccounts};
pub use fsops::{FileOps, ReadChunk, CHUNK_SIZE};
pub use locks::LockManager;
pub use sandbox::Confinement;
pub use service::BrokerService;
