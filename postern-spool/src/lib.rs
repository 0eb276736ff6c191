pub mod accept;
pub mod admin;
pub mod backends;
pub mod config;
pub mod error;
pub mod lock;
pub mod signal;
pub mod store;

pub use accept::{AcceptFilter, accept, accept_filtered};
pub use backends::{FileStore, MemoryStore};
pub use config::SpoolConfig;
pub use error::{Result, SpoolError};
pub use lock::{LockOwner, LockTable};
pub use signal::SpoolSignal;
pub use store::MailStore;
