pub mod address;
pub mod logging;
pub mod mail;
pub mod message;
pub mod status;

pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
