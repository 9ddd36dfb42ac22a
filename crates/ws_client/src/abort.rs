use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Notify;

struct AbortShared {
    aborted: AtomicBool,
    notify: Notify,
}

/// Caller-held handle that cancels a pending request.
///
/// The controller/signal pair is transport-neutral: `abort` flips a
/// flag and wakes every waiter, and aborting after the request resolved
/// is inert.
#[derive(Clone)]
pub struct AbortController {
    shared: Arc<AbortShared>,
}

/// Signal observed by the request path.
#[derive(Clone)]
pub struct AbortSignal {
    shared: Arc<AbortShared>,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(AbortShared {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Resolves when the controller aborts; immediately if it already
    /// has.
    pub async fn aborted(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            // Re-check after registering interest: an abort between the
            // load and `notified` would otherwise be missed.
            let notified = self.shared.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_wakes_waiters_and_is_idempotent() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.aborted().await }
        });
        tokio::task::yield_now().await;

        controller.abort();
        controller.abort();
        waiter.await.unwrap();
        assert!(signal.is_aborted());

        // Pre-aborted signals resolve immediately.
        signal.aborted().await;
    }
}
