//! Mail processing pipeline.
//!
//! Mails in the spool carry a `state` naming the processor that handles them
//! next. A processor is an ordered list of matcher and mailet pairs. The
//! [`SpoolManager`] runs a pool of workers that take mails out of the spool
//! and walk them through processors until they are finished.

pub mod bounce;
pub mod context;
pub mod error;
pub mod mailet;
pub mod manager;
pub mod matcher;
pub mod processor;
pub mod registry;

pub use context::MailetContext;
pub use error::{MailetError, ProcessingError, RegistryError};
pub use mailet::Mailet;
pub use manager::SpoolManager;
pub use matcher::Matcher;
pub use processor::{LinearProcessor, Processors};
pub use registry::{ProcessorConfig, Registry, RegistryContext, StageConfig};
