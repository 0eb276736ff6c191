use postern_spool::SpoolError;
use thiserror::Error;

/// Failure raised by a matcher or mailet while handling one mail.
#[derive(Debug, Error)]
pub enum MailetError {
    /// The message itself could not be handled. A state set by the mailet
    /// before failing is kept.
    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("No processor named '{0}'")]
    UnknownProcessor(String),

    #[error("Matcher {matcher} failed: {source}")]
    Matcher {
        matcher: String,
        #[source]
        source: MailetError,
    },

    #[error("Mailet {mailet} failed: {source}")]
    Mailet {
        mailet: String,
        #[source]
        source: MailetError,
    },

    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),
}

impl ProcessingError {
    pub const fn is_messaging(&self) -> bool {
        matches!(
            self,
            Self::Mailet {
                source: MailetError::Messaging(_),
                ..
            }
        )
    }
}

/// Raised while turning processor configuration into matchers and mailets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown matcher '{0}'")]
    UnknownMatcher(String),

    #[error("Unknown mailet '{0}'")]
    UnknownMailet(String),

    #[error("Matcher {matcher} requires a condition")]
    MissingCondition { matcher: String },

    #[error("Invalid condition for matcher {matcher}: {reason}")]
    InvalidCondition { matcher: String, reason: String },

    #[error("Mailet {mailet} requires parameter '{param}'")]
    MissingParameter { mailet: String, param: String },

    #[error("Mailet {mailet} cannot be used: {reason}")]
    Unavailable { mailet: String, reason: String },

    #[error("Processor '{0}' is defined more than once")]
    DuplicateProcessor(String),
}
