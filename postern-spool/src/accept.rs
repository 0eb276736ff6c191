use std::{
    pin::pin,
    time::{Duration, SystemTime},
};

use postern_common::{
    internal,
    mail::{Mail, MailId},
};

use crate::{LockOwner, MailStore, Result};

/// Decides whether a mail is eligible to be handed out yet.
pub trait AcceptFilter: Send + Sync {
    /// How long until `mail` becomes eligible. Zero means now.
    fn wait_time(&self, mail: &Mail, now: SystemTime) -> Duration;
}

/// Block until an unlocked key can be locked by `owner`.
///
/// Returns `Ok(None)` once the store is closed.
pub async fn accept(store: &dyn MailStore, owner: LockOwner) -> Result<Option<MailId>> {
    accept_inner(store, owner, None).await
}

/// Like [`accept`], but only hands out mails that `filter` considers ready.
/// Sleeps until the earliest time a skipped mail becomes ready, or until
/// the store signals a change.
pub async fn accept_filtered(
    store: &dyn MailStore,
    owner: LockOwner,
    filter: &dyn AcceptFilter,
) -> Result<Option<MailId>> {
    accept_inner(store, owner, Some(filter)).await
}

async fn accept_inner(
    store: &dyn MailStore,
    owner: LockOwner,
    filter: Option<&dyn AcceptFilter>,
) -> Result<Option<MailId>> {
    loop {
        let mut notified = pin!(store.signal().notified());
        notified.as_mut().enable();

        if store.signal().is_closed() {
            return Ok(None);
        }

        let mut next_wake: Option<Duration> = None;

        for id in store.list().await? {
            if !store.lock(&id, owner) {
                continue;
            }

            let Some(filter) = filter else {
                return Ok(Some(id));
            };

            // Unlocking here must not signal, or this worker would wake itself.
            match store.retrieve(&id).await? {
                None => {
                    store.locks().unlock(&id, owner);
                }
                Some(mail) => {
                    let wait = filter.wait_time(&mail, SystemTime::now());
                    if wait.is_zero() {
                        return Ok(Some(id));
                    }

                    store.locks().unlock(&id, owner);
                    next_wake = Some(next_wake.map_or(wait, |current| current.min(wait)));
                }
            }
        }

        match next_wake {
            Some(wait) => {
                internal!(
                    level = TRACE,
                    "{}: nothing ready, sleeping for {wait:?}",
                    store.name()
                );
                tokio::select! {
                    () = notified => {},
                    () = tokio::time::sleep(wait) => {},
                }
            }
            None => notified.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use postern_common::{address::MailAddress, mail::Mail, message::MessageSource};

    use super::*;
    use crate::MemoryStore;

    fn mail() -> Mail {
        Mail::new(
            None,
            vec![MailAddress::new("b", "y")],
            MessageSource::default(),
        )
    }

    struct NotBefore(SystemTime);

    impl AcceptFilter for NotBefore {
        fn wait_time(&self, _mail: &Mail, now: SystemTime) -> Duration {
            self.0.duration_since(now).unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn accept_locks_available_key() {
        let store = MemoryStore::new("spool");
        let mail = mail();
        store.store(&mail).await.unwrap();

        let owner = LockOwner::next();
        let id = accept(&store, owner).await.unwrap();

        assert_eq!(id, Some(mail.id));
        assert_eq!(store.locks().holder(&mail.id), Some(owner));
    }

    #[tokio::test]
    async fn accept_skips_locked_keys_and_wakes_on_store() {
        let store = Arc::new(MemoryStore::new("spool"));
        let locked = mail();
        store.store(&locked).await.unwrap();
        assert!(store.lock(&locked.id, LockOwner::next()));

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { accept(store.as_ref(), LockOwner::next()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let fresh = mail();
        store.store(&fresh).await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(accepted, Some(fresh.id));
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let store = Arc::new(MemoryStore::new("spool"));

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { accept(store.as_ref(), LockOwner::next()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn filtered_accept_waits_until_ready() {
        let store = MemoryStore::new("outgoing");
        let mail = mail();
        store.store(&mail).await.unwrap();

        let ready_at = SystemTime::now() + Duration::from_millis(50);
        let owner = LockOwner::next();
        let accepted = tokio::time::timeout(
            Duration::from_secs(5),
            accept_filtered(&store, owner, &NotBefore(ready_at)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(accepted, Some(mail.id));
        assert!(SystemTime::now() >= ready_at);
    }
}
