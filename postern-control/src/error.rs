use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Protocol error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    #[error("Incompatible protocol version: server={server}, client={client}")]
    Version { server: u32, client: u32 },

    /// The server handled the request and refused it
    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ControlError>;
