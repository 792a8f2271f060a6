//! Shared cancellation flag polled by running tasks.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use courier_errors::{Error, Result};
use tokio::sync::Notify;

/// A shared cancellation token.
///
/// Cancellation is request-only and never preemptive: requesting it flips a
/// flag that tasks poll at their logical yield points (callback entries,
/// iteration heads). Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ControlToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    canceled: AtomicBool,
    notify: Notify,
}

impl ControlToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Request cancellation. Idempotent; wakes everything parked in
    /// [`ControlToken::canceled`].
    pub fn request_cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// `Err(canceled)` when cancellation has been requested; the usual check
    /// at a task's yield points.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::canceled())
        } else {
            Ok(())
        }
    }

    /// Wait until cancellation is requested.
    pub async fn canceled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}
