use std::sync::Arc;

use ahash::AHashMap;
use postern_common::{
    internal,
    mail::{ERROR, Mail},
};

use crate::{Mailet, MailetContext, Matcher, ProcessingError};

#[derive(Debug, Clone)]
struct Stage {
    matcher: Arc<dyn Matcher>,
    mailet: Arc<dyn Mailet>,
}

/// One named processing stage: matcher and mailet pairs applied in order.
///
/// When a matcher selects only some recipients, the mail is split. The
/// selected recipients move to a copy with a new id, which the mailet
/// handles and which then carries on through the remaining pairs by
/// itself. The original keeps the other recipients and skips the mailet.
/// A copy that ends up in another state is queued in the spool.
#[derive(Debug, Clone)]
pub struct LinearProcessor {
    name: String,
    stages: Vec<Stage>,
}

impl LinearProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    #[must_use]
    pub fn add(mut self, matcher: Arc<dyn Matcher>, mailet: Arc<dyn Mailet>) -> Self {
        self.stages.push(Stage { matcher, mailet });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Walk `mail` through this processor.
    ///
    /// On return the mail is finished, or its state names the processor to
    /// run next.
    pub async fn service(
        &self,
        mail: &mut Mail,
        context: &MailetContext,
    ) -> Result<(), ProcessingError> {
        let mut detached = Vec::new();
        let mut unqueued = Vec::new();
        let mut store_error = None;

        let result = self.run(mail, 0, context, &mut detached).await;

        while let Some((mut split, start)) = detached.pop() {
            if let Err(err) = self.run(&mut split, start, context, &mut detached).await {
                route_failure(&mut split, &self.name, &err);
            }

            if split.is_finished() {
                continue;
            }

            match context.spool().store(&split).await {
                Ok(()) => internal!(
                    "Queued mail {} split from {} in state {}",
                    split.id,
                    mail.id,
                    split.state
                ),
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "Failed to queue mail {} split from {}, returning its recipients: {err}",
                        split.id,
                        mail.id
                    );
                    unqueued.append(&mut split.recipients);
                    store_error.get_or_insert(err);
                }
            }
        }

        // Recipients of splits that could not be queued go back to the
        // original, which is then handled as failed
        if let Some(err) = store_error {
            if mail.is_finished() {
                mail.recipients = unqueued;
            } else {
                mail.recipients.append(&mut unqueued);
            }
            return result.and(Err(ProcessingError::Spool(err)));
        }

        result
    }

    async fn run(
        &self,
        mail: &mut Mail,
        start: usize,
        context: &MailetContext,
        detached: &mut Vec<(Mail, usize)>,
    ) -> Result<(), ProcessingError> {
        for (index, stage) in self.stages.iter().enumerate().skip(start) {
            if mail.is_finished() {
                return Ok(());
            }

            let matched = stage
                .matcher
                .matches(mail)
                .map_err(|source| ProcessingError::Matcher {
                    matcher: stage.matcher.name().to_string(),
                    source,
                })?;

            if matched.is_empty() {
                continue;
            }

            if matched.len() < mail.recipients.len() {
                let mut split = mail.duplicate();
                mail.recipients.retain(|recipient| !matched.contains(recipient));
                split.recipients = matched;

                // Resumes at this stage, where it matches in full
                detached.push((split, index));
                continue;
            }

            stage
                .mailet
                .service(mail, context)
                .await
                .map_err(|source| ProcessingError::Mailet {
                    mailet: stage.mailet.name().to_string(),
                    source,
                })?;

            if mail.state != self.name {
                return Ok(());
            }
        }

        if !mail.is_finished() {
            internal!(
                level = WARN,
                "Mail {} reached the end of processor {} and will be discarded",
                mail.id,
                self.name
            );
            mail.ghost();
        }

        Ok(())
    }
}

/// Route a mail after a fault in processor `processor`.
///
/// A fault in the error processor ends the mail, so it cannot loop. A
/// messaging fault keeps a state the mailet already set. Anything else moves
/// the mail to the error processor.
pub(crate) fn route_failure(mail: &mut Mail, processor: &str, err: &ProcessingError) {
    mail.set_error(err.to_string());

    if processor == ERROR {
        internal!(
            level = ERROR,
            "Mail {} failed in the error processor, discarding it: {err}",
            mail.id
        );
        mail.ghost();
    } else if err.is_messaging() && mail.state != processor {
        internal!(
            level = WARN,
            "Mail {} hit a messaging fault, continuing in {}: {err}",
            mail.id,
            mail.state
        );
    } else {
        internal!(
            level = WARN,
            "Mail {} failed in processor {processor}: {err}",
            mail.id
        );
        mail.set_state(ERROR);
    }
}

/// Processors by name.
#[derive(Debug, Default, Clone)]
pub struct Processors {
    processors: AHashMap<String, LinearProcessor>,
}

impl Processors {
    /// Add a processor, returning any processor it replaced.
    pub fn insert(&mut self, processor: LinearProcessor) -> Option<LinearProcessor> {
        self.processors
            .insert(processor.name().to_string(), processor)
    }

    pub fn get(&self, name: &str) -> Option<&LinearProcessor> {
        self.processors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use postern_common::{
        address::MailAddress,
        mail::{DEFAULT, ERROR, GHOST, Mail},
        message::MessageSource,
    };
    use postern_spool::{MailStore, MemoryStore};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        MailetError,
        mailet::{AddHeader, Null, ToProcessor},
        matcher::{All, HostIs},
    };

    /// Counts how often it runs and how many recipients it saw.
    #[derive(Debug, Default)]
    pub struct Counting {
        pub calls: AtomicUsize,
        pub recipients: AtomicUsize,
    }

    #[async_trait]
    impl Mailet for Counting {
        fn name(&self) -> &'static str {
            "Counting"
        }

        async fn service(&self, mail: &mut Mail, _: &MailetContext) -> Result<(), MailetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.recipients
                .fetch_add(mail.recipients.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    pub struct Failing;

    #[async_trait]
    impl Mailet for Failing {
        fn name(&self) -> &'static str {
            "Failing"
        }

        async fn service(&self, _: &mut Mail, _: &MailetContext) -> Result<(), MailetError> {
            Err(MailetError::Failed(String::from("boom")))
        }
    }

    pub fn context(spool: Arc<MemoryStore>) -> MailetContext {
        MailetContext::new(
            spool,
            "mx.example",
            MailAddress::new("postmaster", "mx.example"),
            vec![String::from("example.com")],
        )
    }

    pub fn mail(recipients: &[(&str, &str)]) -> Mail {
        Mail::new(
            Some(MailAddress::new("a", "x")),
            recipients
                .iter()
                .map(|(local, domain)| MailAddress::new(*local, *domain))
                .collect(),
            MessageSource::parse(b"Subject: hi\r\n\r\nbody").unwrap(),
        )
    }

    #[tokio::test]
    async fn ghosting_stops_the_chain() {
        let spool = Arc::new(MemoryStore::new("spool"));
        let after = Arc::new(Counting::default());
        let processor = LinearProcessor::new(DEFAULT)
            .add(Arc::new(All), Arc::new(Null))
            .add(Arc::new(All), after.clone());

        let mut mail = mail(&[("b", "y")]);
        processor.service(&mut mail, &context(spool.clone())).await.unwrap();

        assert_eq!(mail.state, GHOST);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
        assert!(spool.is_empty());
    }

    #[tokio::test]
    async fn unchanged_state_continues_and_end_ghosts() {
        let spool = Arc::new(MemoryStore::new("spool"));
        let counting = Arc::new(Counting::default());
        let processor = LinearProcessor::new(DEFAULT)
            .add(Arc::new(All), Arc::new(AddHeader::new("X-One", "1")))
            .add(Arc::new(All), counting.clone());

        let mut mail = mail(&[("b", "y"), ("c", "y")]);
        processor.service(&mut mail, &context(spool)).await.unwrap();

        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counting.recipients.load(Ordering::SeqCst), 2);
        assert_eq!(mail.message.header("X-One"), Some("1"));
        assert_eq!(mail.state, GHOST);
    }

    #[tokio::test]
    async fn partial_match_splits_the_mail() {
        let spool = Arc::new(MemoryStore::new("spool"));
        let counting = Arc::new(Counting::default());
        let processor = LinearProcessor::new(DEFAULT)
            .add(
                Arc::new(HostIs::new("remote.org").unwrap()),
                Arc::new(ToProcessor::new("transport", None)),
            )
            .add(Arc::new(All), counting.clone())
            .add(Arc::new(All), Arc::new(ToProcessor::new("local", None)));

        let mut mail = mail(&[("b", "example.com"), ("c", "remote.org"), ("d", "example.com")]);
        let id = mail.id;
        processor.service(&mut mail, &context(spool.clone())).await.unwrap();

        // The original keeps the unmatched recipients and went on
        assert_eq!(mail.id, id);
        assert_eq!(mail.state, "local");
        assert_eq!(
            mail.recipients,
            vec![
                MailAddress::new("b", "example.com"),
                MailAddress::new("d", "example.com")
            ]
        );
        assert_eq!(counting.recipients.load(Ordering::SeqCst), 2);

        // The split went to transport and was queued
        let ids = spool.list().await.unwrap();
        assert_eq!(ids.len(), 1);
        let split = spool.retrieve(&ids[0]).await.unwrap().unwrap();
        assert_ne!(split.id, id);
        assert_eq!(split.state, "transport");
        assert_eq!(split.recipients, vec![MailAddress::new("c", "remote.org")]);
    }

    #[tokio::test]
    async fn split_that_finishes_is_not_queued() {
        let spool = Arc::new(MemoryStore::new("spool"));
        let processor = LinearProcessor::new(DEFAULT)
            .add(Arc::new(HostIs::new("remote.org").unwrap()), Arc::new(Null))
            .add(Arc::new(All), Arc::new(ToProcessor::new("local", None)));

        let mut mail = mail(&[("b", "example.com"), ("c", "remote.org")]);
        processor.service(&mut mail, &context(spool.clone())).await.unwrap();

        assert_eq!(mail.state, "local");
        assert_eq!(mail.recipients.len(), 1);
        assert!(spool.is_empty());
    }

    #[tokio::test]
    async fn failing_split_is_routed_to_error() {
        let spool = Arc::new(MemoryStore::new("spool"));
        let processor = LinearProcessor::new(DEFAULT)
            .add(Arc::new(HostIs::new("remote.org").unwrap()), Arc::new(Failing))
            .add(Arc::new(All), Arc::new(Null));

        let mut mail = mail(&[("b", "example.com"), ("c", "remote.org")]);
        processor.service(&mut mail, &context(spool.clone())).await.unwrap();

        assert!(mail.is_ghost());
        let ids = spool.list().await.unwrap();
        let split = spool.retrieve(&ids[0]).await.unwrap().unwrap();
        assert_eq!(split.state, ERROR);
        assert_eq!(
            split.error_message.as_deref(),
            Some("Mailet Failing failed: boom")
        );
    }

    #[tokio::test]
    async fn unqueued_split_returns_its_recipients() {
        let spool = Arc::new(MemoryStore::new("spool").with_capacity(1));
        spool.store(&mail(&[("z", "y")])).await.unwrap();

        let processor = LinearProcessor::new(DEFAULT)
            .add(
                Arc::new(HostIs::new("remote.org").unwrap()),
                Arc::new(ToProcessor::new("transport", None)),
            )
            .add(Arc::new(All), Arc::new(Null));

        let mut mail = mail(&[("b", "example.com"), ("c", "remote.org"), ("d", "remote.org")]);
        let err = processor
            .service(&mut mail, &context(spool.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::Spool(_)));
        assert_eq!(
            mail.recipients,
            vec![
                MailAddress::new("c", "remote.org"),
                MailAddress::new("d", "remote.org")
            ]
        );

        route_failure(&mut mail, DEFAULT, &err);
        assert_eq!(mail.state, ERROR);
        assert!(!mail.is_finished());
        assert_eq!(spool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mailet_fault_is_returned() {
        let spool = Arc::new(MemoryStore::new("spool"));
        let processor = LinearProcessor::new(DEFAULT).add(Arc::new(All), Arc::new(Failing));

        let mut mail = mail(&[("b", "y")]);
        let err = processor
            .service(&mut mail, &context(spool))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessingError::Mailet { .. }));
        assert_eq!(mail.state, DEFAULT);
    }

    #[test]
    fn failure_routing() {
        let failed = ProcessingError::Mailet {
            mailet: String::from("X"),
            source: MailetError::Failed(String::from("boom")),
        };
        let messaging = ProcessingError::Mailet {
            mailet: String::from("X"),
            source: MailetError::Messaging(String::from("bad")),
        };

        let mut in_root = mail(&[("b", "y")]);
        route_failure(&mut in_root, DEFAULT, &failed);
        assert_eq!(in_root.state, ERROR);
        assert!(in_root.error_message.is_some());

        let mut in_error = mail(&[("b", "y")]);
        in_error.set_state(ERROR);
        route_failure(&mut in_error, ERROR, &failed);
        assert_eq!(in_error.state, GHOST);

        let mut rerouted = mail(&[("b", "y")]);
        rerouted.set_state("spam");
        route_failure(&mut rerouted, DEFAULT, &messaging);
        assert_eq!(rerouted.state, "spam");

        let mut unchanged = mail(&[("b", "y")]);
        route_failure(&mut unchanged, DEFAULT, &messaging);
        assert_eq!(unchanged.state, ERROR);
    }
}
