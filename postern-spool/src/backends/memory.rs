use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use postern_common::mail::{Mail, MailId};

use crate::{LockTable, MailStore, Result, SpoolError, SpoolSignal};

/// In-memory store.
///
/// Mail bodies are shared, so storing and retrieving only clones the
/// envelope and header block. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    name: String,
    mails: RwLock<AHashMap<MailId, Mail>>,
    /// Maximum number of mails held (None = unlimited)
    capacity: Option<usize>,
    locks: LockTable,
    signal: SpoolSignal,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn len(&self) -> usize {
        self.mails.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, mail: &Mail) -> Result<()> {
        {
            let mut mails = self.mails.write();
            if let Some(capacity) = self.capacity
                && mails.len() >= capacity
                && !mails.contains_key(&mail.id)
            {
                return Err(SpoolError::Capacity(capacity));
            }
            mails.insert(mail.id, mail.clone());
        }

        self.signal.notify_all();
        Ok(())
    }

    async fn retrieve(&self, id: &MailId) -> Result<Option<Mail>> {
        Ok(self.mails.read().get(id).cloned())
    }

    async fn remove(&self, id: &MailId) -> Result<()> {
        self.mails.write().remove(id);
        self.locks.release(id);
        self.signal.notify_all();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MailId>> {
        let mut ids = self.mails.read().keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        Ok(ids)
    }

    fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn signal(&self) -> &SpoolSignal {
        &self.signal
    }
}
