use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use postern_common::{internal, mail::Mail};
use postern_spool::MailStore;

use crate::{MailetContext, MailetError};

/// Acts on a mail whose recipients have been narrowed to those a matcher
/// selected.
///
/// A mailet may edit the message, drop recipients, or move the mail to
/// another processor by changing its state. Setting a new state ends the
/// mail's walk through the current processor.
#[async_trait]
pub trait Mailet: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn service(&self, mail: &mut Mail, context: &MailetContext) -> Result<(), MailetError>;
}

/// Discards the mail.
#[derive(Debug, Default)]
pub struct Null;

#[async_trait]
impl Mailet for Null {
    fn name(&self) -> &'static str {
        "Null"
    }

    async fn service(&self, mail: &mut Mail, _context: &MailetContext) -> Result<(), MailetError> {
        mail.ghost();
        Ok(())
    }
}

#[derive(Debug)]
pub struct ToProcessor {
    processor: String,
    notice: Option<String>,
}

impl ToProcessor {
    pub fn new(processor: impl Into<String>, notice: Option<String>) -> Self {
        Self {
            processor: processor.into(),
            notice,
        }
    }
}

#[async_trait]
impl Mailet for ToProcessor {
    fn name(&self) -> &'static str {
        "ToProcessor"
    }

    async fn service(&self, mail: &mut Mail, _context: &MailetContext) -> Result<(), MailetError> {
        internal!("Sending mail {} to processor {}", mail.id, self.processor);

        if let Some(notice) = &self.notice {
            mail.set_error(notice.clone());
        }
        mail.set_state(self.processor.clone());

        Ok(())
    }
}

#[derive(Debug)]
pub struct AddHeader {
    name: String,
    value: String,
}

impl AddHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Mailet for AddHeader {
    fn name(&self) -> &'static str {
        "AddHeader"
    }

    async fn service(&self, mail: &mut Mail, _context: &MailetContext) -> Result<(), MailetError> {
        if self.name.contains([':', '\r', '\n']) || self.value.contains(['\r', '\n']) {
            return Err(MailetError::Messaging(format!(
                "Refusing to add malformed header {}",
                self.name
            )));
        }

        mail.message.add_header(self.name.clone(), self.value.clone());
        Ok(())
    }
}

/// Stores a copy of the mail for its recipients in the inbox store, then
/// finishes the mail for them.
#[derive(Debug)]
pub struct LocalDelivery {
    inbox: Arc<dyn MailStore>,
}

impl LocalDelivery {
    pub fn new(inbox: Arc<dyn MailStore>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl Mailet for LocalDelivery {
    fn name(&self) -> &'static str {
        "LocalDelivery"
    }

    async fn service(&self, mail: &mut Mail, _context: &MailetContext) -> Result<(), MailetError> {
        let mut delivered = mail.duplicate();
        delivered.message.prepend_header("Delivered-To", recipients_list(mail));
        self.inbox.store(&delivered).await?;

        internal!(
            level = INFO,
            "Delivered mail {} locally for {} as {}",
            mail.id,
            recipients_list(mail),
            delivered.id
        );

        mail.ghost();
        Ok(())
    }
}

fn recipients_list(mail: &Mail) -> String {
    mail.recipients
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Returns the mail to its sender with the recorded error, then discards it.
#[derive(Debug, Default)]
pub struct Bounce;

#[async_trait]
impl Mailet for Bounce {
    fn name(&self) -> &'static str {
        "Bounce"
    }

    async fn service(&self, mail: &mut Mail, context: &MailetContext) -> Result<(), MailetError> {
        let reason = mail
            .error_message
            .clone()
            .unwrap_or_else(|| String::from("Delivery failed"));

        context.bounce(mail, &mail.recipients, &reason).await?;
        mail.ghost();

        Ok(())
    }
}
