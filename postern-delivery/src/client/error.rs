use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed reply: {0}")]
    Parse(String),

    #[error("Reply is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The server answered a command with a 4xx or 5xx reply.
    #[error("{command} rejected: {code} {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    #[error("Connection closed by server")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
