use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use postern_common::mail::MailId;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of whoever holds a spool lock: a worker, an admin call, a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(u64);

impl LockOwner {
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Advisory per-key locks.
///
/// A key has at most one holder. Locking a key you already hold succeeds
/// again, so a holder can safely retry.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<MailId, LockOwner>,
}

impl LockTable {
    pub fn lock(&self, id: &MailId, owner: LockOwner) -> bool {
        match self.locks.entry(*id) {
            Entry::Occupied(held) => *held.get() == owner,
            Entry::Vacant(free) => {
                free.insert(owner);
                true
            }
        }
    }

    /// Returns false if the key was not locked, or is held by someone else.
    pub fn unlock(&self, id: &MailId, owner: LockOwner) -> bool {
        self.locks
            .remove_if(id, |_, holder| *holder == owner)
            .is_some()
    }

    /// Drop the lock regardless of holder. Used once the key itself is gone.
    pub fn release(&self, id: &MailId) {
        self.locks.remove(id);
    }

    pub fn holder(&self, id: &MailId) -> Option<LockOwner> {
        self.locks.get(id).map(|holder| *holder)
    }

    pub fn is_locked(&self, id: &MailId) -> bool {
        self.locks.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use postern_common::mail::MailId;

    use super::*;

    #[test]
    fn unlock_without_lock_is_false() {
        let table = LockTable::default();
        assert!(!table.unlock(&MailId::generate(), LockOwner::next()));
    }

    #[test]
    fn second_holder_is_refused_until_unlock() {
        let table = LockTable::default();
        let id = MailId::generate();
        let (first, second) = (LockOwner::next(), LockOwner::next());

        assert!(table.lock(&id, first));
        assert!(!table.lock(&id, second));
        assert!(!table.unlock(&id, second));
        assert_eq!(table.holder(&id), Some(first));

        assert!(table.unlock(&id, first));
        assert!(table.lock(&id, second));
    }

    #[test]
    fn relocking_by_the_holder_succeeds() {
        let table = LockTable::default();
        let id = MailId::generate();
        let owner = LockOwner::next();

        assert!(table.lock(&id, owner));
        assert!(table.lock(&id, owner));
        assert!(table.unlock(&id, owner));
        assert!(!table.is_locked(&id));
    }

    #[test]
    fn exactly_one_thread_wins() {
        let table = Arc::new(LockTable::default());
        let id = MailId::generate();
        let barrier = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let owner = LockOwner::next();
                    barrier.wait();
                    table.lock(&id, owner)
                })
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
