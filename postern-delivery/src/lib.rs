//! Delivery of mail to remote servers.
//!
//! The `RemoteDelivery` mailet moves mail from processing into the outgoing
//! spool. A [`DeliveryService`] drains that spool: it resolves each
//! recipient domain, talks SMTP to its servers, retries on a schedule, and
//! bounces what cannot be delivered.

pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod remote;
pub mod retry;
pub mod service;
pub mod transaction;

pub use config::DeliveryConfig;
pub use dns::{DnsResolver, MailServer, MxResolver, StaticResolver};
pub use error::{DeliveryError, DnsError, PermanentError, TemporaryError};
pub use remote::RemoteDelivery;
pub use retry::{RetryError, RetrySchedule};
pub use service::DeliveryService;
pub use transaction::{Outcome, SmtpTransaction};
