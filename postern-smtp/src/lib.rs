pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod reply;
pub mod server;
pub mod session;
pub mod state;

pub use auth::{StaticUsers, UsersRepository};
pub use config::{AuthRequired, SmtpConfig};
pub use server::SmtpServer;
pub use session::{Session, SessionContext};
