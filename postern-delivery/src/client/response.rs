use super::error::{ClientError, Result};

/// A complete server reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 2xx or 3xx
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub const fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Whether an EHLO reply advertises `keyword`.
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }

    /// Turn a negative reply into an error naming the command it answered.
    pub fn into_result(self, command: &str) -> Result<Self> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(ClientError::Rejected {
                command: command.to_string(),
                code: self.code,
                message: self.message(),
            })
        }
    }

    fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
        let code = line
            .get(..3)
            .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (200..600).contains(code))
            .ok_or_else(|| ClientError::Parse(format!("Invalid reply code in '{line}'")))?;

        let last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(other) => {
                return Err(ClientError::Parse(format!(
                    "Invalid separator '{}' in '{line}'",
                    char::from(*other)
                )));
            }
        };

        Ok((code, last, line.get(4..).unwrap_or_default()))
    }

    /// Parse one reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it used, or `None` when
    /// the buffer does not hold a complete reply yet.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let (line_code, last, text) = Self::parse_line(std::str::from_utf8(raw)?)?;
            if let Some(code) = code
                && code != line_code
            {
                return Err(ClientError::Parse(format!(
                    "Reply code changed from {code} to {line_code} mid reply"
                )));
            }

            code = Some(line_code);
            lines.push(text.to_string());

            if last {
                return Ok(Some((Self::new(line_code, lines), consumed)));
            }
        }

        Ok(None)
    }
}
