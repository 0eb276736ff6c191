use std::{fmt, str::FromStr, sync::LazyLock, time::SystemTime};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

use crate::{address::MailAddress, message::MessageSource};

/// Initial processing state of every new mail.
pub const DEFAULT: &str = "root";
/// Terminal state: discard without further processing.
pub const GHOST: &str = "ghost";
/// State a mail is moved to when a processing stage faults.
pub const ERROR: &str = "error";

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Unique mail identifier.
///
/// Generated from the current time plus a monotonic counter, so ids created
/// within the same millisecond still sort in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailId(Ulid);

impl MailId {
    pub fn generate() -> Self {
        let id = GENERATOR.lock().generate().unwrap_or_else(|_| Ulid::new());
        Self(id)
    }

    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for MailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MailId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// The unit of work moving through the spool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub id: MailId,
    /// `None` is the null sender `<>`
    pub sender: Option<MailAddress>,
    pub recipients: Vec<MailAddress>,
    pub message: MessageSource,
    pub state: String,
    pub error_message: Option<String>,
    pub remote_host: String,
    pub remote_addr: String,
    pub last_updated: SystemTime,
    pub attributes: AHashMap<String, String>,
}

impl Mail {
    pub fn new(
        sender: Option<MailAddress>,
        recipients: Vec<MailAddress>,
        message: MessageSource,
    ) -> Self {
        Self {
            id: MailId::generate(),
            sender,
            recipients,
            message,
            state: DEFAULT.to_string(),
            error_message: None,
            remote_host: String::from("localhost"),
            remote_addr: String::from("127.0.0.1"),
            last_updated: SystemTime::now(),
            attributes: AHashMap::default(),
        }
    }

    /// Copy with a fresh id. The message body is shared, not copied.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            id: MailId::generate(),
            last_updated: SystemTime::now(),
            ..self.clone()
        }
    }

    pub fn is_ghost(&self) -> bool {
        self.state == GHOST
    }

    /// Finished mails are removed from the spool instead of being requeued.
    pub fn is_finished(&self) -> bool {
        self.is_ghost() || self.recipients.is_empty()
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
    }

    pub fn ghost(&mut self) {
        self.set_state(GHOST);
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub fn touch(&mut self) {
        self.last_updated = SystemTime::now();
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Sender formatted as an SMTP reverse path.
    pub fn reverse_path(&self) -> String {
        self.sender
            .as_ref()
            .map_or_else(|| String::from("<>"), |sender| format!("<{sender}>"))
    }
}
