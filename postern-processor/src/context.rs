use std::sync::Arc;

use postern_common::{
    address::MailAddress,
    internal,
    mail::{Mail, MailId},
};
use postern_spool::{MailStore, SpoolError};

use crate::bounce;

/// Services offered to mailets: the root spool, and what they need to know
/// about this server.
#[derive(Debug, Clone)]
pub struct MailetContext {
    spool: Arc<dyn MailStore>,
    hostname: String,
    postmaster: MailAddress,
    local_domains: Arc<[String]>,
}

impl MailetContext {
    pub fn new(
        spool: Arc<dyn MailStore>,
        hostname: impl Into<String>,
        postmaster: MailAddress,
        local_domains: impl Into<Arc<[String]>>,
    ) -> Self {
        Self {
            spool,
            hostname: hostname.into(),
            postmaster,
            local_domains: local_domains.into(),
        }
    }

    pub fn spool(&self) -> &Arc<dyn MailStore> {
        &self.spool
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub const fn postmaster(&self) -> &MailAddress {
        &self.postmaster
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains
            .iter()
            .any(|local| local.eq_ignore_ascii_case(domain))
    }

    /// Queue a new mail in the root spool.
    pub async fn send_mail(&self, mail: &Mail) -> Result<(), SpoolError> {
        self.spool.store(mail).await?;
        internal!("Queued mail {} in {}", mail.id, self.spool.name());
        Ok(())
    }

    /// Tell the sender of `mail` that `recipients` could not be reached.
    ///
    /// Returns the id of the bounce, or `None` for mail with a null sender,
    /// which is never bounced.
    pub async fn bounce(
        &self,
        mail: &Mail,
        recipients: &[MailAddress],
        reason: &str,
    ) -> Result<Option<MailId>, SpoolError> {
        let Some(bounce) = bounce::build(mail, recipients, reason, &self.hostname, &self.postmaster)
        else {
            internal!(
                level = WARN,
                "Not bouncing mail {} with a null sender: {reason}",
                mail.id
            );
            return Ok(None);
        };

        self.send_mail(&bounce).await?;
        internal!(
            level = INFO,
            "Bounced mail {} to {} as {}",
            mail.id,
            mail.reverse_path(),
            bounce.id
        );

        Ok(Some(bounce.id))
    }
}
