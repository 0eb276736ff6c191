use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;
use postern_common::address::{self, MailAddress};

/// ESMTP parameters of a `MAIL FROM` command (RFC 5321 section 3.3).
///
/// Keys are stored upper-cased. `SIZE` is validated on parse, the rest
/// are kept verbatim.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<String, Option<String>>,
}

impl MailParameters {
    /// Parse `KEY=VALUE` and `FLAG` tokens.
    ///
    /// # Errors
    /// On a repeated parameter, or a `SIZE` that is zero or not a number.
    pub fn from_params_str(params: &str) -> Result<Self, String> {
        let mut parsed = Self::default();

        for token in params.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));
            let key = key.to_ascii_uppercase();

            if parsed.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.map(str::parse::<usize>) {
                    Some(Ok(0)) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(Ok(_)) => {}
                    _ => return Err(format!("Invalid SIZE value: {}", value.unwrap_or(""))),
                }
            }

            parsed.params.insert(key, value.map(str::to_string));
        }

        Ok(parsed)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_uppercase())?.as_deref()
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(&key.to_ascii_uppercase())
    }

    /// Declared message size in bytes (RFC 1870).
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    pub fn name(&self) -> &str {
        match self {
            Self::Ehlo(name) | Self::Helo(name) => name,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// `None` is the null sender
    MailFrom(Option<MailAddress>, MailParameters),
    RcptTo(MailAddress),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
}

/// Why a line could not be turned into a [`Command`].
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ParseError {
    /// The verb is not one we know. Answered with 500.
    Unrecognised(String),
    /// A known verb with bad arguments. Answered with 501.
    Syntax(Cow<'static, str>),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(HeloVariant::Ehlo(id)) => write!(fmt, "EHLO {id}"),
            Self::Helo(HeloVariant::Helo(id)) => write!(fmt, "HELO {id}"),
            // Never log credentials
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::MailFrom(sender, _) => write!(
                fmt,
                "MAIL FROM:<{}>",
                sender.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
            Self::RcptTo(recipient) => write!(fmt, "RCPT TO:<{recipient}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Vrfy(arg) => write!(fmt, "VRFY {arg}"),
            Self::Expn(arg) => write!(fmt, "EXPN {arg}"),
            Self::Help(None) => fmt.write_str("HELP"),
            Self::Help(Some(topic)) => write!(fmt, "HELP {topic}"),
        }
    }
}

/// Strip a case-insensitive `prefix` such as `FROM:`.
fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    input
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &input[prefix.len()..])
}

fn parse_mail(argument: &str) -> Result<Command, ParseError> {
    let rest = strip_prefix_ignore_case(argument, "FROM:")
        .ok_or_else(|| ParseError::Syntax(Cow::Borrowed("Usage: MAIL FROM:<sender>")))?
        .trim();

    let (path, params) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));

    let sender = address::parse_reverse_path(path)
        .map_err(|err| ParseError::Syntax(Cow::Owned(format!("Syntax error in sender address: {err}"))))?;
    let params = MailParameters::from_params_str(params).map_err(|err| ParseError::Syntax(Cow::Owned(err)))?;

    Ok(Command::MailFrom(sender, params))
}

fn parse_rcpt(argument: &str) -> Result<Command, ParseError> {
    let rest = strip_prefix_ignore_case(argument, "TO:")
        .ok_or_else(|| ParseError::Syntax(Cow::Borrowed("Usage: RCPT TO:<recipient>")))?
        .trim();

    // Parameters after the path are accepted and ignored
    let path = rest.split_whitespace().next().unwrap_or_default();

    address::parse_forward_path(path).map(Command::RcptTo).map_err(|err| {
        ParseError::Syntax(Cow::Owned(format!(
            "Syntax error in recipient address: {err}"
        )))
    })
}

impl TryFrom<&str> for Command {
    type Error = ParseError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let trimmed = line.trim();
        let (verb, argument) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(verb, argument)| (verb, argument.trim()));

        let required = |usage: &'static str| {
            if argument.is_empty() {
                Err(ParseError::Syntax(Cow::Borrowed(usage)))
            } else {
                Ok(argument.to_string())
            }
        };

        let domain = |usage: &'static str, extra: &'static str| {
            required(usage).and_then(|id| {
                if id.contains(char::is_whitespace) {
                    Err(ParseError::Syntax(Cow::Borrowed(extra)))
                } else {
                    Ok(id)
                }
            })
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => domain("Domain address required: HELO", "Usage: HELO <domain>")
                .map(|id| Self::Helo(HeloVariant::Helo(id))),
            "EHLO" => domain("Domain address required: EHLO", "Usage: EHLO <domain>")
                .map(|id| Self::Helo(HeloVariant::Ehlo(id))),
            "AUTH" => {
                let mut parts = argument.split_whitespace();
                let mechanism = parts.next().ok_or(ParseError::Syntax(Cow::Borrowed(
                    "Usage: AUTH (authentication type) <challenge>",
                )))?;

                Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial: parts.next().map(str::to_string),
                })
            }
            "MAIL" => parse_mail(argument),
            "RCPT" => parse_rcpt(argument),
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            "VRFY" => Ok(Self::Vrfy(argument.to_string())),
            "EXPN" => Ok(Self::Expn(argument.to_string())),
            "HELP" => Ok(Self::Help(
                (!argument.is_empty()).then(|| argument.to_string()),
            )),
            _ => Err(ParseError::Unrecognised(trimmed.to_string())),
        }
    }
}
