use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, futures::Notified};

/// Wakes idle spool workers when keys become available, and tells them to
/// stop once the spool is closed.
#[derive(Debug, Default)]
pub struct SpoolSignal {
    notify: Notify,
    closed: AtomicBool,
}

impl SpoolSignal {
    /// Register interest before scanning so a wakeup between the scan and
    /// the wait is not lost. Call `enable` on the pinned future.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
