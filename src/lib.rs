//! CloudVault library
//!
//! Secure file storage over a mutually authenticated, replay-protected TCP
//! protocol: ECDH handshake, AES-GCM envelope with per-direction counters,
//! and upload/download/list/rename/delete operations on per-user storage.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod log;
pub mod logger;
pub mod pki;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod server;
pub mod store;
pub mod transfer;
pub mod url;

pub use client::{Client, ClientOptions, Operation, OperationOutcome};
pub use error::{ProtocolError, ProtocolResult};
pub use server::{serve, serve_listener, ServerContext};
