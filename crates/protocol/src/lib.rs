//! # RemoVault Protocol Library
//!
//! This crate provides wire protocol definitions and codecs for the
//! RemoVault remote file service.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of RemoVault's communication layer,
//! providing:
//!
//! - **Control Messages**: the 13-byte-header binary frames exchanged
//!   between clients and the daemon
//! - **Directory Listings**: fixed-width entry rows carried in listing
//!   payloads
//! - **Broker IPC**: length-prefixed request/response frames between the
//!   daemon and the privileged broker
//! - **Data-Channel Handshake**: the `DATA_PORT` line that hands a client
//!   off to an out-of-band transfer socket
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │    Client commands / status / data      │
//! ├─────────────────────────────────────────┤
//! │   Control framing (13-byte header)      │  TCP control channel
//! ├────────────────────┬────────────────────┤
//! │   Data channels    │    Broker IPC      │  ephemeral TCP / Unix socket
//! └────────────────────┴────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: control-channel message codec
//! - [`listing`]: directory listing encoding
//! - [`broker`]: broker IPC request/response codec
//! - [`handshake`]: data-channel handshake line
//! - [`error`]: error types

pub mod broker;
pub mod error;
pub mod handshake;
pub mod listing;
pub mod wire;

pub use broker::{
    BrokerCommand, BrokerPayload, BrokerRequest, BrokerResponse, CallerIdentity,
    MAX_BROKER_FRAME_SIZE,
};
pub use error::{ProtocolError, Result};
pub use handshake::{DataChannelHandshake, DATA_PORT_KEYWORD};
pub use listing::{decode_entries, encode_entries, FileEntry, ENTRY_SIZE, NAME_WIDTH, PERMS_WIDTH};
pub use wire::{
    read_message, write_message, Message, MessageCodec, MessageType, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, STATUS_ERR, STATUS_OK,
};
