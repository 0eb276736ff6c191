use postern_common::address::MailAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelloMode {
    #[default]
    None,
    Helo,
    Ehlo,
}

/// Where in the protocol a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connected,
    HelloGiven,
    MailFrom,
    RcptGiven(usize),
}

/// Negotiated state of one SMTP connection.
///
/// The transaction fields (`sender`, `recipients`, `declared_size`) are
/// cleared together; the hello mode and authenticated user outlive
/// transactions.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub hello_mode: HelloMode,
    pub hello_name: Option<String>,
    /// Set by RSET so the client may greet again
    pub rehello_allowed: bool,
    pub authenticated_user: Option<String>,
    /// `Some(None)` is the null sender
    pub sender: Option<Option<MailAddress>>,
    pub recipients: Vec<MailAddress>,
    pub declared_size: Option<usize>,
    /// Set after a failed DATA. Quiets logging until RSET.
    pub message_failed: bool,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match (&self.hello_mode, &self.sender) {
            (_, Some(_)) if !self.recipients.is_empty() => Phase::RcptGiven(self.recipients.len()),
            (_, Some(_)) => Phase::MailFrom,
            (HelloMode::None, None) => Phase::Connected,
            (_, None) => Phase::HelloGiven,
        }
    }

    pub const fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    pub const fn is_extended(&self) -> bool {
        matches!(self.hello_mode, HelloMode::Ehlo)
    }

    /// Record a greeting. Returns false for a repeated greeting that RSET
    /// did not allow.
    pub fn greet(&mut self, mode: HelloMode, name: &str) -> bool {
        if self.hello_mode != HelloMode::None && !self.rehello_allowed {
            return false;
        }

        self.hello_mode = mode;
        self.hello_name = Some(name.to_string());
        self.rehello_allowed = false;
        self.reset_transaction();
        true
    }

    /// End of a transaction, successful or not.
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.declared_size = None;
    }

    pub fn rset(&mut self) {
        self.reset_transaction();
        self.message_failed = false;
        self.rehello_allowed = true;
    }
}
