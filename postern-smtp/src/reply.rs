use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
};

use postern_common::status::Status;

/// One reply to one command, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub lines: Vec<Cow<'static, str>>,
}

impl Reply {
    pub fn new(status: Status, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }

    pub const fn multiline(status: Status, lines: Vec<Cow<'static, str>>) -> Self {
        Self { status, lines }
    }

    pub fn ok(text: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Status::Ok, text)
    }
}

/// `250-first`, `250-second`, `250 last`, joined with CRLF and without a
/// trailing line terminator.
impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);

        if self.lines.is_empty() {
            return write!(f, "{}", self.status);
        }

        for (idx, line) in self.lines.iter().enumerate() {
            if idx == last {
                write!(f, "{} {line}", self.status)?;
            } else {
                write!(f, "{}-{line}\r\n", self.status)?;
            }
        }

        Ok(())
    }
}
