//! Workers draining the outgoing spool.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use postern_common::{
    Signal, internal,
    mail::{Mail, MailId},
};
use postern_processor::MailetContext;
use postern_spool::{LockOwner, MailStore, SpoolError, accept_filtered};
use tokio::sync::broadcast;

use crate::{
    DeliveryConfig, DeliveryError, DnsResolver, MxResolver, StaticResolver,
    retry::{RETRY_COUNT, retry_count},
    transaction::{Outcome, SmtpTransaction},
};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Delivers mail from the outgoing spool to remote servers.
///
/// Mail that cannot be delivered yet stays in the outgoing spool until its
/// next retry is due. Permanent failures, and mail that has used up its
/// retries, are bounced to the sender through the root spool.
#[derive(Debug)]
pub struct DeliveryService {
    outgoing: Arc<dyn MailStore>,
    context: MailetContext,
    resolver: Arc<dyn MxResolver>,
    config: DeliveryConfig,
}

impl DeliveryService {
    pub fn new(
        outgoing: Arc<dyn MailStore>,
        context: MailetContext,
        resolver: Arc<dyn MxResolver>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            outgoing,
            context,
            resolver,
            config,
        }
    }

    /// The resolver `config` asks for: its gateways when it has any, DNS
    /// otherwise.
    pub fn resolver(config: &DeliveryConfig) -> Result<Arc<dyn MxResolver>, DeliveryError> {
        if config.gateway.is_empty() {
            Ok(Arc::new(DnsResolver::new(config.dns.clone())?))
        } else {
            Ok(Arc::new(StaticResolver::from_addresses(&config.gateway)?))
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let threads = self.config.delivery_threads.max(1);
        internal!(level = INFO, "Starting {threads} delivery workers");

        let workers = (0..threads)
            .map(|index| {
                let service = Arc::clone(&self);
                tokio::spawn(async move { service.work(index).await })
            })
            .collect::<Vec<_>>();

        loop {
            match shutdown.recv().await {
                Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }

        internal!(level = INFO, "Delivery shutting down, waiting for workers ...");
        self.outgoing.close();
        join_all(workers).await;
        internal!(level = INFO, "Delivery workers stopped");
    }

    async fn work(&self, index: usize) {
        let owner = LockOwner::next();

        loop {
            match self.handle_next(owner).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    internal!(level = ERROR, "Delivery worker {index}: {err}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        internal!("Delivery worker {index} stopped");
    }

    /// Attempt one mail whose retry is due. `Ok(false)` once the outgoing
    /// spool is closed.
    pub async fn handle_next(&self, owner: LockOwner) -> Result<bool, SpoolError> {
        let Some(id) =
            accept_filtered(self.outgoing.as_ref(), owner, &self.config.delay_time).await?
        else {
            return Ok(false);
        };

        let mail = match self.outgoing.retrieve(&id).await {
            Ok(Some(mail)) => mail,
            Ok(None) => {
                self.outgoing.unlock(&id, owner);
                return Ok(true);
            }
            Err(SpoolError::Corrupted { reason, .. }) => {
                internal!(level = ERROR, "Discarding unreadable outgoing mail {id}: {reason}");
                self.outgoing.remove(&id).await?;
                return Ok(true);
            }
            Err(err) => {
                self.outgoing.unlock(&id, owner);
                return Err(err);
            }
        };

        let outcome = self.deliver(&mail).await;
        if let Err(err) = self.settle(id, owner, mail, outcome).await {
            self.outgoing.unlock(&id, owner);
            return Err(err);
        }

        Ok(true)
    }

    /// Try each server for the mail's domain in turn, until one of them
    /// gives a definite answer.
    pub async fn deliver(&self, mail: &Mail) -> Outcome {
        let Some(domain) = mail.recipients.first().map(|r| r.domain.clone()) else {
            return Outcome::default();
        };

        let servers = match self.resolver.resolve(&domain).await {
            Ok(servers) => servers,
            Err(err) => {
                internal!(level = WARN, "Cannot resolve {domain} for mail {}: {err}", mail.id);
                return Outcome::failed(&mail.recipients, &DeliveryError::from(err));
            }
        };

        let transaction = SmtpTransaction::new(
            mail,
            self.context.hostname(),
            Duration::from_secs(self.config.timeout),
            self.config.sendpartial,
        );

        let mut last = None;
        for server in servers.iter() {
            match transaction.execute(server).await {
                Ok(outcome) => return outcome,
                Err(err) if err.is_temporary() => {
                    internal!(
                        level = WARN,
                        "Mail {} not delivered via {}: {err}",
                        mail.id,
                        server.address()
                    );
                    last = Some(err);
                }
                Err(err) => return Outcome::failed(&mail.recipients, &err),
            }
        }

        last.map_or_else(Outcome::default, |err| {
            Outcome::failed(&mail.recipients, &err)
        })
    }

    async fn settle(
        &self,
        id: MailId,
        owner: LockOwner,
        mut mail: Mail,
        outcome: Outcome,
    ) -> Result<(), SpoolError> {
        let reason = outcome
            .reason
            .clone()
            .unwrap_or_else(|| String::from("Delivery failed"));

        if !outcome.delivered.is_empty() {
            internal!(
                level = INFO,
                "Delivered mail {id} to {} recipient(s)",
                outcome.delivered.len()
            );
        }

        if !outcome.rejected.is_empty() {
            self.context.bounce(&mail, &outcome.rejected, &reason).await?;
        }

        if outcome.deferred.is_empty() {
            return self.outgoing.remove(&id).await;
        }

        let attempts = retry_count(&mail) + 1;
        if attempts >= self.config.max_retries {
            internal!(
                level = WARN,
                "Giving up on mail {id} after {attempts} attempt(s): {reason}"
            );
            let reason = format!("{reason} (gave up after {attempts} attempts)");
            self.context.bounce(&mail, &outcome.deferred, &reason).await?;
            return self.outgoing.remove(&id).await;
        }

        let wait = self.config.delay_time.delay(attempts);
        internal!(
            level = INFO,
            "Mail {id} deferred for {} recipient(s), attempt {attempts} of {}, retrying in {wait:?}: {reason}",
            outcome.deferred.len(),
            self.config.max_retries
        );

        mail.recipients = outcome.deferred;
        mail.set_attribute(RETRY_COUNT, attempts.to_string());
        mail.set_error(reason);
        mail.touch();

        self.outgoing.store(&mail).await?;
        self.outgoing.unlock(&id, owner);
        Ok(())
    }
}
