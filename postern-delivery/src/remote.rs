use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use postern_common::{address::MailAddress, internal, mail::Mail};
use postern_processor::{Mailet, MailetContext, MailetError, Registry};
use postern_spool::MailStore;

use crate::retry::RETRY_COUNT;

/// Hands mail over to the outgoing spool, one mail per recipient domain,
/// and finishes the original.
#[derive(Debug)]
pub struct RemoteDelivery {
    outgoing: Arc<dyn MailStore>,
}

impl RemoteDelivery {
    pub fn new(outgoing: Arc<dyn MailStore>) -> Self {
        Self { outgoing }
    }

    /// Make `RemoteDelivery` available to processor configuration.
    pub fn register(registry: &mut Registry, outgoing: Arc<dyn MailStore>) {
        registry.register_mailet("RemoteDelivery", move |_| {
            Ok(Arc::new(Self::new(Arc::clone(&outgoing))))
        });
    }
}

fn by_domain(recipients: &[MailAddress]) -> Vec<Vec<MailAddress>> {
    let mut index = AHashMap::new();
    let mut groups: Vec<Vec<MailAddress>> = Vec::new();

    for recipient in recipients {
        let slot = *index
            .entry(recipient.domain.to_ascii_lowercase())
            .or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
        groups[slot].push(recipient.clone());
    }

    groups
}

#[async_trait]
impl Mailet for RemoteDelivery {
    fn name(&self) -> &'static str {
        "RemoteDelivery"
    }

    async fn service(&self, mail: &mut Mail, _context: &MailetContext) -> Result<(), MailetError> {
        for recipients in by_domain(&mail.recipients) {
            let mut outgoing = mail.duplicate();
            outgoing.recipients = recipients;
            outgoing.error_message = None;
            outgoing.attributes.remove(RETRY_COUNT);
            outgoing.touch();

            self.outgoing.store(&outgoing).await?;
            internal!(
                "Queued mail {} for remote delivery to {} as {}",
                mail.id,
                outgoing.recipients[0].domain,
                outgoing.id
            );
        }

        mail.ghost();
        Ok(())
    }
}
