//! Worker pool draining the root spool.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use postern_common::{
    Signal, internal,
    mail::{Mail, MailId},
};
use postern_spool::{LockOwner, MailStore, SpoolError, accept};
use tokio::sync::broadcast;

use crate::{MailetContext, ProcessingError, Processors, processor::route_failure};

/// Pause after a spool error before a worker tries again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Runs a fixed number of workers, each taking mails from the spool and
/// walking them through processors until they are finished.
#[derive(Debug)]
pub struct SpoolManager {
    spool: Arc<dyn MailStore>,
    processors: Processors,
    context: MailetContext,
    threads: usize,
}

impl SpoolManager {
    pub fn new(processors: Processors, context: MailetContext, threads: usize) -> Self {
        Self {
            spool: Arc::clone(context.spool()),
            processors,
            context,
            threads: threads.max(1),
        }
    }

    /// Run the workers until shutdown. Each worker finishes the mail it
    /// holds before stopping.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            "Starting {} spool workers on {}",
            self.threads,
            self.spool.name()
        );

        let workers = (0..self.threads)
            .map(|index| {
                let manager = Arc::clone(&self);
                tokio::spawn(async move { manager.work(index).await })
            })
            .collect::<Vec<_>>();

        loop {
            match shutdown.recv().await {
                Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }

        internal!(level = INFO, "Spool manager shutting down, waiting for workers ...");
        self.spool.close();
        join_all(workers).await;
        internal!(level = INFO, "Spool workers stopped");
    }

    async fn work(&self, index: usize) {
        let owner = LockOwner::next();
        internal!("Spool worker {index} running as {owner}");

        loop {
            match self.handle_next(owner).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    internal!(level = ERROR, "Spool worker {index}: {err}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        internal!("Spool worker {index} stopped");
    }

    /// Take one mail from the spool and process it. `Ok(false)` once the
    /// spool is closed.
    pub async fn handle_next(&self, owner: LockOwner) -> Result<bool, SpoolError> {
        let Some(id) = accept(self.spool.as_ref(), owner).await? else {
            return Ok(false);
        };

        let mail = match self.spool.retrieve(&id).await {
            Ok(Some(mail)) => mail,
            Ok(None) => {
                // Removed after it was listed
                self.spool.unlock(&id, owner);
                return Ok(true);
            }
            Err(SpoolError::Corrupted { reason, .. }) => {
                internal!(level = ERROR, "Discarding unreadable mail {id}: {reason}");
                self.spool.remove(&id).await?;
                return Ok(true);
            }
            Err(err) => {
                self.spool.unlock(&id, owner);
                return Err(err);
            }
        };

        if let Err(err) = self.finish(id, owner, mail).await {
            self.spool.unlock(&id, owner);
            return Err(err);
        }

        Ok(true)
    }

    async fn finish(&self, id: MailId, owner: LockOwner, mut mail: Mail) -> Result<(), SpoolError> {
        self.process(&mut mail).await;

        if mail.is_finished() {
            internal!("Mail {id} finished, removing it from {}", self.spool.name());
            return self.spool.remove(&id).await;
        }

        mail.touch();
        let stored = self.spool.store(&mail).await;
        self.spool.unlock(&id, owner);
        stored
    }

    /// Run processors until the mail is finished, starting with the one
    /// named by its state.
    ///
    /// Faults never escape: the mail is moved to the error processor, or
    /// discarded when the fault happened there.
    pub async fn process(&self, mail: &mut Mail) {
        while !mail.is_finished() {
            let current = mail.state.clone();

            let result = match self.processors.get(&current) {
                Some(processor) => processor.service(mail, &self.context).await,
                None => Err(ProcessingError::UnknownProcessor(current.clone())),
            };

            if let Err(err) = result {
                route_failure(mail, &current, &err);
            } else if mail.state == current && !mail.is_finished() {
                // Processors ghost what falls off their end, so this is
                // only reachable with a custom mailet that resets the state.
                mail.ghost();
            }
        }
    }
}
