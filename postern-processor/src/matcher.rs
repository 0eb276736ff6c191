use std::{fmt::Debug, sync::Arc};

use ahash::AHashSet;
use postern_common::{address::MailAddress, mail::Mail};

use crate::{MailetError, RegistryError};

/// Selects the recipients of a mail that a mailet should act on.
///
/// Matchers are built once from configuration and shared between all
/// workers, so they keep no per-mail state.
pub trait Matcher: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// The matched subset of `mail.recipients`. Empty when nothing matches.
    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError>;
}

fn everyone(mail: &Mail, matched: bool) -> Vec<MailAddress> {
    if matched {
        mail.recipients.clone()
    } else {
        Vec::new()
    }
}

fn filter_recipients(mail: &Mail, predicate: impl Fn(&MailAddress) -> bool) -> Vec<MailAddress> {
    mail.recipients
        .iter()
        .filter(|recipient| predicate(recipient))
        .cloned()
        .collect()
}

/// Split a comma separated condition into its non-empty parts.
fn list(matcher: &str, condition: &str) -> Result<Vec<String>, RegistryError> {
    let items = condition
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();

    if items.is_empty() {
        return Err(RegistryError::MissingCondition {
            matcher: matcher.to_string(),
        });
    }

    Ok(items)
}

fn addresses(matcher: &str, condition: &str) -> Result<Vec<MailAddress>, RegistryError> {
    list(matcher, condition)?
        .iter()
        .map(|item| {
            item.parse::<MailAddress>().map_err(|err| RegistryError::InvalidCondition {
                matcher: matcher.to_string(),
                reason: format!("{item}: {err}"),
            })
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct All;

impl Matcher for All {
    fn name(&self) -> &'static str {
        "All"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        Ok(mail.recipients.clone())
    }
}

/// Recipients in one of the given domains.
#[derive(Debug)]
pub struct HostIs {
    domains: Vec<String>,
}

impl HostIs {
    pub fn new(condition: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            domains: list("HostIs", condition)?,
        })
    }
}

impl Matcher for HostIs {
    fn name(&self) -> &'static str {
        "HostIs"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        Ok(filter_recipients(mail, |recipient| {
            self.domains
                .iter()
                .any(|domain| recipient.is_in_domain(domain))
        }))
    }
}

/// Recipients in a domain this server is the destination for.
#[derive(Debug)]
pub struct HostIsLocal {
    local_domains: Arc<[String]>,
}

impl HostIsLocal {
    pub const fn new(local_domains: Arc<[String]>) -> Self {
        Self { local_domains }
    }
}

impl Matcher for HostIsLocal {
    fn name(&self) -> &'static str {
        "HostIsLocal"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        Ok(filter_recipients(mail, |recipient| {
            self.local_domains
                .iter()
                .any(|domain| recipient.is_in_domain(domain))
        }))
    }
}

/// Recipients that are known users in a local domain.
#[derive(Debug)]
pub struct RecipientIsLocal {
    local_domains: Arc<[String]>,
    users: Arc<AHashSet<String>>,
}

impl RecipientIsLocal {
    pub const fn new(local_domains: Arc<[String]>, users: Arc<AHashSet<String>>) -> Self {
        Self {
            local_domains,
            users,
        }
    }
}

impl Matcher for RecipientIsLocal {
    fn name(&self) -> &'static str {
        "RecipientIsLocal"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        Ok(filter_recipients(mail, |recipient| {
            self.local_domains
                .iter()
                .any(|domain| recipient.is_in_domain(domain))
                && self
                    .users
                    .contains(&recipient.local_part.to_ascii_lowercase())
        }))
    }
}

#[derive(Debug)]
pub struct RecipientIs {
    addresses: Vec<MailAddress>,
}

impl RecipientIs {
    pub fn new(condition: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            addresses: addresses("RecipientIs", condition)?,
        })
    }
}

impl Matcher for RecipientIs {
    fn name(&self) -> &'static str {
        "RecipientIs"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        Ok(filter_recipients(mail, |recipient| {
            self.addresses
                .iter()
                .any(|address| address.same_mailbox(recipient))
        }))
    }
}

/// All recipients, when the mail comes from one of the given senders.
#[derive(Debug)]
pub struct SenderIs {
    senders: Vec<MailAddress>,
}

impl SenderIs {
    pub fn new(condition: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            senders: addresses("SenderIs", condition)?,
        })
    }
}

impl Matcher for SenderIs {
    fn name(&self) -> &'static str {
        "SenderIs"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        let matched = mail.sender.as_ref().is_some_and(|sender| {
            self.senders
                .iter()
                .any(|address| address.same_mailbox(sender))
        });

        Ok(everyone(mail, matched))
    }
}

#[derive(Debug)]
pub struct HasHeader {
    header: String,
}

impl HasHeader {
    pub fn new(condition: &str) -> Result<Self, RegistryError> {
        let header = condition.trim();
        if header.is_empty() {
            return Err(RegistryError::MissingCondition {
                matcher: String::from("HasHeader"),
            });
        }

        Ok(Self {
            header: header.to_string(),
        })
    }
}

impl Matcher for HasHeader {
    fn name(&self) -> &'static str {
        "HasHeader"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        Ok(everyone(mail, mail.message.has_header(&self.header)))
    }
}

/// All recipients, once a mail has passed through at least `limit` hops.
/// Catches mail loops.
#[derive(Debug)]
pub struct RelayLimit {
    limit: usize,
}

impl RelayLimit {
    pub fn new(condition: &str) -> Result<Self, RegistryError> {
        let limit = condition
            .trim()
            .parse::<usize>()
            .map_err(|err| RegistryError::InvalidCondition {
                matcher: String::from("RelayLimit"),
                reason: format!("{condition}: {err}"),
            })?;

        Ok(Self { limit })
    }
}

impl Matcher for RelayLimit {
    fn name(&self) -> &'static str {
        "RelayLimit"
    }

    fn matches(&self, mail: &Mail) -> Result<Vec<MailAddress>, MailetError> {
        let hops = mail.message.headers_named("Received").count();
        Ok(everyone(mail, hops >= self.limit))
    }
}
