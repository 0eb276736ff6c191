use async_trait::async_trait;
use postern_common::mail::{Mail, MailId};

use crate::{LockOwner, LockTable, Result, SpoolSignal};

/// A durable queue of mails keyed by id, with advisory per-key locks.
///
/// Every mutation that can make a key available (`store`, `remove`,
/// `unlock`) wakes workers blocked in [`crate::accept`].
#[async_trait]
pub trait MailStore: Send + Sync + std::fmt::Debug {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn store(&self, mail: &Mail) -> Result<()>;

    /// `Ok(None)` if the key no longer exists.
    async fn retrieve(&self, id: &MailId) -> Result<Option<Mail>>;

    /// Remove the mail. This also releases any lock on its key.
    async fn remove(&self, id: &MailId) -> Result<()>;

    async fn list(&self) -> Result<Vec<MailId>>;

    fn locks(&self) -> &LockTable;

    fn signal(&self) -> &SpoolSignal;

    fn lock(&self, id: &MailId, owner: LockOwner) -> bool {
        self.locks().lock(id, owner)
    }

    fn unlock(&self, id: &MailId, owner: LockOwner) -> bool {
        let unlocked = self.locks().unlock(id, owner);
        if unlocked {
            self.signal().notify_all();
        }
        unlocked
    }

    /// Stop handing out keys. Blocked `accept` calls return `None`.
    fn close(&self) {
        self.signal().close();
    }
}
