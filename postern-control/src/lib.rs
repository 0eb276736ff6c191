//! Control socket for a running postern instance.
//!
//! `posternctl` uses it to list and manage mails in the live stores, so
//! admin operations share the server's locks and wake its workers. Requests
//! and responses are length-prefixed bincode frames over a Unix socket.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    PROTOCOL_VERSION, Request, Response, ResponsePayload, Selection, SpoolCommand, StoreName,
};
pub use server::{CommandHandler, ControlServer};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/postern.sock";
