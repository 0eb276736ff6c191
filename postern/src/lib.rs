//! The postern mail server: configuration loading and the controller that
//! starts the SMTP listener, the spool manager, remote delivery and the
//! control socket, and stops them again on shutdown.

pub mod control_handler;
pub mod controller;

pub use controller::{Components, Postern, SHUTDOWN_BROADCAST};
