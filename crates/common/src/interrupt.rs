//! Cooperative cancellation signal
//!
//! A latch shared between the I/O driver and whatever delivers cancellation
//! requests (a signal handler, an administrative command). The flag is
//! sticky: waiters observe it with [`InterruptSignal::is_pending`] at their
//! checkpoints, and [`InterruptSignal::wakeup`] wakes anyone parked in a
//! blocking wait so the checkpoint runs promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

/// Shared cancellation latch.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<Inner>,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake any parked waiter.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether a cancellation request is pending.
    pub fn is_pending(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Clear a previously delivered request.
    pub fn clear(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Park until the next wakeup. The caller must re-check
    /// [`InterruptSignal::is_pending`] afterwards; wakeups can be spurious.
    ///
    /// A request that lands between the caller's pending-check and this call
    /// is not lost: the future registers for wakeups at creation, and the
    /// flag is checked once more before parking.
    pub async fn wakeup(&self) {
        let notified = self.inner.notify.notified();
        if self.is_pending() {
            return;
        }
        notified.await;
    }
}
