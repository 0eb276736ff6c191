use std::{borrow::Cow, io};

use postern_common::status::Status;
use thiserror::Error;

use crate::reply::Reply;

/// A command was rejected. The session carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {message}")]
pub struct ProtocolError {
    pub status: Status,
    pub message: Cow<'static, str>,
}

impl ProtocolError {
    pub fn new(status: Status, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn sequence(message: &'static str) -> Self {
        Self::new(Status::InvalidCommandSequence, message)
    }

    pub fn syntax(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Status::SyntaxError, message)
    }
}

impl From<ProtocolError> for Reply {
    fn from(err: ProtocolError) -> Self {
        Self::new(err.status, err.message)
    }
}

/// The session cannot continue.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("Client disconnected")]
    Disconnected,

    #[error("Session idle for {0} seconds")]
    Timeout(u64),

    #[error("Server is shutting down")]
    Shutdown,
}

impl SessionError {
    /// Errors that are a normal end of a session rather than a fault.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout(_) | Self::Shutdown)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
