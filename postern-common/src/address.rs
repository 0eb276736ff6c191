//! SMTP mailbox parsing for `MAIL FROM` and `RCPT TO` paths.
//!
//! Accepts `<local@domain>`, the null path `<>` for reverse paths, and the
//! deprecated source route form `<@relay:local@domain>` (the route is dropped).
//! Size limits follow RFC 5321 section 4.5.3.1.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

const MAX_PATH: usize = 256;
const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Path exceeds {MAX_PATH} octets")]
    PathTooLong,
    #[error("Local-part exceeds {MAX_LOCAL_PART} octets")]
    LocalPartTooLong,
    #[error("Domain exceeds {MAX_DOMAIN} octets")]
    DomainTooLong,
    #[error("Path must be enclosed in '<' and '>'")]
    MissingBrackets,
    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,
    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
}

/// A mailbox, `local_part@domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailAddress {
    pub local_part: String,
    pub domain: String,
}

impl MailAddress {
    pub fn new(local_part: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local_part: local_part.into(),
            domain: domain.into(),
        }
    }

    /// Domain comparison is case-insensitive.
    pub fn is_in_domain(&self, domain: &str) -> bool {
        self.domain.eq_ignore_ascii_case(domain)
    }

    /// Mailbox comparison: local-part exact, domain case-insensitive.
    pub fn same_mailbox(&self, other: &Self) -> bool {
        self.local_part == other.local_part && self.is_in_domain(&other.domain)
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for MailAddress {
    type Err = AddressError;

    /// Parse a bare mailbox without angle brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        parse_mailbox(trimmed)
    }
}

/// Parse a reverse path. `Ok(None)` is the null sender `<>`.
pub fn parse_reverse_path(input: &str) -> Result<Option<MailAddress>, AddressError> {
    let trimmed = input.trim();
    check_path_length(trimmed)?;

    if trimmed == "<>" {
        return Ok(None);
    }

    parse_path(trimmed).map(Some)
}

pub fn parse_forward_path(input: &str) -> Result<MailAddress, AddressError> {
    let trimmed = input.trim();
    check_path_length(trimmed)?;

    parse_path(trimmed)
}

const fn check_path_length(input: &str) -> Result<(), AddressError> {
    if input.is_empty() {
        Err(AddressError::Empty)
    } else if input.len() > MAX_PATH {
        Err(AddressError::PathTooLong)
    } else {
        Ok(())
    }
}

fn parse_path(input: &str) -> Result<MailAddress, AddressError> {
    let content = input
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .ok_or(AddressError::MissingBrackets)?;

    let mailbox = if content.starts_with('@') {
        content
            .split_once(':')
            .map_or(content, |(_route, mailbox)| mailbox)
    } else {
        content
    };

    parse_mailbox(mailbox)
}

fn parse_mailbox(input: &str) -> Result<MailAddress, AddressError> {
    let at = find_unquoted_at(input).ok_or(AddressError::MissingAtSign)?;
    let (local_part, domain) = (&input[..at], &input[at + 1..]);

    if local_part.len() > MAX_LOCAL_PART {
        return Err(AddressError::LocalPartTooLong);
    }
    if domain.len() > MAX_DOMAIN {
        return Err(AddressError::DomainTooLong);
    }

    validate_local_part(local_part)?;
    validate_domain(domain)?;

    Ok(MailAddress::new(local_part, domain))
}

fn find_unquoted_at(input: &str) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    let mut at = None;

    for (idx, ch) in input.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '@' if !quoted => at = Some(idx),
            _ => {}
        }
    }

    at
}

const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn validate_local_part(local: &str) -> Result<(), AddressError> {
    if local.is_empty() {
        return Err(AddressError::InvalidLocalPart("empty".to_string()));
    }

    if let Some(inner) = local.strip_prefix('"') {
        return match inner.strip_suffix('"') {
            Some(body) if body.chars().all(|ch| ch == ' ' || ch.is_ascii_graphic()) => Ok(()),
            _ => Err(AddressError::InvalidLocalPart(local.to_string())),
        };
    }

    if local.split('.').any(|atom| atom.is_empty()) {
        return Err(AddressError::InvalidLocalPart(format!(
            "misplaced '.' in {local}"
        )));
    }

    match local.chars().find(|&ch| ch != '.' && !is_atext(ch)) {
        Some(ch) => Err(AddressError::InvalidLocalPart(format!(
            "invalid character '{ch}'"
        ))),
        None => Ok(()),
    }
}

fn validate_domain(domain: &str) -> Result<(), AddressError> {
    if domain.is_empty() {
        return Err(AddressError::InvalidDomain("empty".to_string()));
    }

    if let Some(literal) = domain.strip_prefix('[') {
        let literal = literal
            .strip_suffix(']')
            .ok_or_else(|| AddressError::InvalidDomain(domain.to_string()))?;
        let address = literal.strip_prefix("IPv6:").unwrap_or(literal);
        return address
            .parse::<std::net::IpAddr>()
            .map(|_| ())
            .map_err(|_| AddressError::InvalidDomain(domain.to_string()));
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && label.starts_with(|c: char| c.is_ascii_alphanumeric())
            && label.ends_with(|c: char| c.is_ascii_alphanumeric())
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

        if !valid {
            return Err(AddressError::InvalidDomain(domain.to_string()));
        }
    }

    Ok(())
}
