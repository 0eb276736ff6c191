use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Stored data exists but cannot be turned back into a mail.
    #[error("Corrupted spool entry {id}: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("Spool is full ({0} messages)")]
    Capacity(usize),
}

pub type Result<T> = std::result::Result<T, SpoolError>;
