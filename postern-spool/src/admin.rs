//! Administrative operations over a store: list, remove, resend and move
//! mails selected by state and/or a header pattern.
//!
//! Each operation takes the spool lock for every mail it touches. Mails that
//! are currently held by a worker are reported back in `locking_failures`
//! instead of failing the whole batch.

use std::time::{SystemTime, UNIX_EPOCH};

use postern_common::{
    address::MailAddress,
    internal,
    mail::{Mail, MailId},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{LockOwner, MailStore, Result};

#[derive(Debug, Clone, Default)]
pub struct SpoolFilter {
    state: Option<String>,
    header: Option<(String, Regex)>,
}

impl SpoolFilter {
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Match mails having a header `name` whose value matches `pattern`.
    pub fn with_header(
        mut self,
        name: impl Into<String>,
        pattern: &str,
    ) -> std::result::Result<Self, regex::Error> {
        self.header = Some((name.into(), Regex::new(pattern)?));
        Ok(self)
    }

    pub fn matches(&self, mail: &Mail) -> bool {
        let state_matches = self.state.as_ref().is_none_or(|state| &mail.state == state);
        let header_matches = self.header.as_ref().is_none_or(|(name, pattern)| {
            mail.message
                .headers_named(name)
                .any(|value| pattern.is_match(value))
        });

        state_matches && header_matches
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolItem {
    pub id: MailId,
    pub state: String,
    pub sender: Option<MailAddress>,
    pub recipients: Vec<MailAddress>,
    pub error_message: Option<String>,
    pub last_updated: SystemTime,
}

impl From<&Mail> for SpoolItem {
    fn from(mail: &Mail) -> Self {
        Self {
            id: mail.id,
            state: mail.state.clone(),
            sender: mail.sender.clone(),
            recipients: mail.recipients.clone(),
            error_message: mail.error_message.clone(),
            last_updated: mail.last_updated,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolReport {
    pub affected: Vec<MailId>,
    pub locking_failures: Vec<MailId>,
}

/// Read-only, so it takes no locks.
pub async fn list_spool_items(store: &dyn MailStore, filter: &SpoolFilter) -> Result<Vec<SpoolItem>> {
    let mut items = Vec::new();

    for id in store.list().await? {
        if let Some(mail) = store.retrieve(&id).await?
            && filter.matches(&mail)
        {
            items.push(SpoolItem::from(&mail));
        }
    }

    Ok(items)
}

enum Action<'a> {
    Remove,
    Resend,
    Move(&'a dyn MailStore),
}

pub async fn remove_spool_items(
    store: &dyn MailStore,
    key: Option<MailId>,
    filter: &SpoolFilter,
) -> Result<SpoolReport> {
    apply(store, key, filter, Action::Remove).await
}

/// Make matching mails eligible immediately and wake any waiting workers.
pub async fn resend_spool_items(
    store: &dyn MailStore,
    key: Option<MailId>,
    filter: &SpoolFilter,
) -> Result<SpoolReport> {
    apply(store, key, filter, Action::Resend).await
}

pub async fn move_spool_items(
    from: &dyn MailStore,
    to: &dyn MailStore,
    key: Option<MailId>,
    filter: &SpoolFilter,
) -> Result<SpoolReport> {
    apply(from, key, filter, Action::Move(to)).await
}

async fn apply(
    store: &dyn MailStore,
    key: Option<MailId>,
    filter: &SpoolFilter,
    action: Action<'_>,
) -> Result<SpoolReport> {
    let owner = LockOwner::next();
    let mut report = SpoolReport::default();

    let keys = match key {
        Some(key) => vec![key],
        None => store.list().await?,
    };

    for id in keys {
        if !store.lock(&id, owner) {
            report.locking_failures.push(id);
            continue;
        }

        let mail = match store.retrieve(&id).await {
            Ok(Some(mail)) if filter.matches(&mail) => mail,
            Ok(_) => {
                store.unlock(&id, owner);
                continue;
            }
            Err(err) => {
                store.unlock(&id, owner);
                return Err(err);
            }
        };

        let outcome = match action {
            Action::Remove => store.remove(&id).await,
            Action::Resend => {
                let mut mail = mail;
                mail.last_updated = UNIX_EPOCH;
                let stored = store.store(&mail).await;
                store.unlock(&id, owner);
                stored
            }
            Action::Move(target) => match target.store(&mail).await {
                Ok(()) => store.remove(&id).await,
                Err(err) => {
                    store.unlock(&id, owner);
                    Err(err)
                }
            },
        };

        outcome?;
        report.affected.push(id);
    }

    internal!(
        level = INFO,
        "{}: {} mails affected, {} locked by others",
        store.name(),
        report.affected.len(),
        report.locking_failures.len()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;
    use postern_common::{address::MailAddress, mail::ERROR, message::MessageSource};

    use super::*;
    use crate::{MemoryStore, accept};

    fn mail(subject: &str) -> Mail {
        Mail::new(
            Some(MailAddress::new("a", "x")),
            vec![MailAddress::new("b", "y")],
            MessageSource::parse(format!("Subject: {subject}\r\n\r\nbody").as_bytes()).unwrap(),
        )
    }

    #[tokio::test]
    async fn filters_by_state_and_header() {
        let store = MemoryStore::new("spool");
        let mut failed = mail("invoice 42");
        failed.set_state(ERROR);
        store.store(&failed).await.unwrap();
        store.store(&mail("invoice 43")).await.unwrap();
        store.store(&mail("hello")).await.unwrap();

        let errors = list_spool_items(&store, &SpoolFilter::default().with_state(ERROR))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, failed.id);

        let invoices = SpoolFilter::default()
            .with_header("subject", r"^invoice \d+$")
            .unwrap();
        assert_eq!(list_spool_items(&store, &invoices).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resend_resets_last_updated() {
        let store = MemoryStore::new("outgoing");
        let mail = mail("retry me");
        store.store(&mail).await.unwrap();

        let report = resend_spool_items(&store, Some(mail.id), &SpoolFilter::default())
            .await
            .unwrap();

        assert_eq!(report.affected, vec![mail.id]);
        let resent = store.retrieve(&mail.id).await.unwrap().unwrap();
        assert_eq!(resent.last_updated, UNIX_EPOCH);
        assert!(!store.locks().is_locked(&mail.id));
    }

    #[tokio::test]
    async fn locked_mail_is_a_locking_failure() {
        let store = MemoryStore::new("spool");
        let held = mail("held");
        let free = mail("free");
        store.store(&held).await.unwrap();
        store.store(&free).await.unwrap();

        let worker = accept(&store, LockOwner::next()).await.unwrap().unwrap();
        assert_eq!(worker, held.id.min(free.id));

        let report = resend_spool_items(&store, None, &SpoolFilter::default())
            .await
            .unwrap();

        assert_eq!(report.locking_failures, vec![worker]);
        assert_eq!(report.affected.len(), 1);
        assert_ne!(
            store.retrieve(&worker).await.unwrap().unwrap().last_updated,
            UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn racing_admin_and_worker_never_share_a_mail() {
        for _ in 0..32 {
            let store = Arc::new(MemoryStore::new("spool"));
            let mail = mail("race");
            store.store(&mail).await.unwrap();

            let worker = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let owner = LockOwner::next();
                    tokio::time::timeout(Duration::from_millis(50), accept(store.as_ref(), owner))
                        .await
                        .ok()
                        .and_then(Result::ok)
                        .flatten()
                })
            };
            let admin = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    remove_spool_items(store.as_ref(), Some(mail.id), &SpoolFilter::default())
                        .await
                        .unwrap()
                })
            };

            let accepted = worker.await.unwrap();
            let report = admin.await.unwrap();

            match accepted {
                Some(id) => {
                    assert_eq!(id, mail.id);
                    assert_eq!(report.locking_failures, vec![mail.id]);
                    assert!(report.affected.is_empty());
                }
                None => assert_eq!(report.affected, vec![mail.id]),
            }
        }
    }

    #[tokio::test]
    async fn move_between_stores() {
        let spool = MemoryStore::new("spool");
        let errors = MemoryStore::new("errors");
        let mut failed = mail("broken");
        failed.set_state(ERROR);
        spool.store(&failed).await.unwrap();
        spool.store(&mail("fine")).await.unwrap();

        let report = move_spool_items(&spool, &errors, None, &SpoolFilter::default().with_state(ERROR))
            .await
            .unwrap();

        assert_eq!(report.affected, vec![failed.id]);
        assert_eq!(spool.len(), 1);
        assert_eq!(errors.retrieve(&failed.id).await.unwrap(), Some(failed));
    }
}
