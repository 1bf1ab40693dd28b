// Cancellation shared between the side that starts a transfer and the task running it.
//
// The control side may only request an abort. The worker polls `is_aborted()` before each send
// and between receive attempts, and can park on `aborted()` while it is idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    aborted: AtomicBool,
    notify: Notify,
}

/// A cloneable abort flag. Every clone observes the same state.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl AbortHandle {
    pub fn new() -> AbortHandle {
        AbortHandle::default()
    }

    /// Sets the flag and wakes anything parked in `aborted()`. Idempotent.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    /// Resolves once `abort()` has been called.
    pub async fn aborted(&self) {
        loop {
            // Register before checking so an abort between the check and the await is not lost.
            let notified = self.shared.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}
