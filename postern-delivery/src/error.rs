//! Delivery failures, split by whether another attempt can help.

use thiserror::Error;

use crate::client::ClientError;

#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A or AAAA records
    #[error("No mail servers found for domain {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    #[error("Invalid gateway address '{0}'")]
    InvalidGateway(String),
}

impl DnsError {
    /// A domain without reachable servers is retried like a refused
    /// connection. Only a broken gateway setting is final.
    pub const fn is_temporary(&self) -> bool {
        !matches!(self, Self::InvalidGateway(_))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),
}

/// Failures that will not go away by retrying.
#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("{0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{0}")]
    Timeout(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("No mail servers for domain {0}")]
    NoMailServers(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DeliveryError {
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => TemporaryError::NoMailServers(domain).into(),
            DnsError::LookupFailed(err) => TemporaryError::DnsLookupFailed(err.to_string()).into(),
            DnsError::InvalidGateway(gateway) => {
                PermanentError::Configuration(format!("invalid gateway {gateway}")).into()
            }
        }
    }
}

/// 4xx replies and anything that went wrong on the wire are temporary.
/// 5xx replies are permanent.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Rejected { code, .. } if code >= 500 => {
                PermanentError::Rejected(error.to_string()).into()
            }
            ClientError::Rejected { .. } => TemporaryError::Rejected(error.to_string()).into(),
            ClientError::Io(err) => TemporaryError::ConnectionFailed(err.to_string()).into(),
            ClientError::ConnectionClosed => {
                TemporaryError::ConnectionFailed(error.to_string()).into()
            }
            ClientError::Parse(_) | ClientError::Utf8(_) => {
                TemporaryError::Protocol(error.to_string()).into()
            }
        }
    }
}
