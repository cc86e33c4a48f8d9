//! Run-wide stop event.
//!
//! Setting it is synchronous and idempotent, so it can be wired straight
//! into an interrupt handler. The first exit code wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// Stored in `code` while the event is clear.
const UNSET: i64 = i64::MIN;

#[derive(Debug)]
struct Inner {
    code: AtomicI64,
    notify: Notify,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            code: AtomicI64::new(UNSET),
            notify: Notify::new(),
        }
    }
}

/// Cloneable stop flag with async wait.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event. Returns false if it was already set.
    pub fn trigger(&self, code: i32) -> bool {
        let won = self
            .inner
            .code
            .compare_exchange(UNSET, i64::from(code), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    pub fn is_set(&self) -> bool {
        self.inner.code.load(Ordering::SeqCst) != UNSET
    }

    /// Exit code of the first trigger, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self.inner.code.load(Ordering::SeqCst) {
            UNSET => None,
            code => i32::try_from(code).ok(),
        }
    }

    /// Resolve once the event is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Clear the event for a new run.
    pub fn reset(&self) {
        self.inner.code.store(UNSET, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_trigger_wins() {
        let stop = StopSignal::new();
        assert!(!stop.is_set());
        assert_eq!(stop.exit_code(), None);

        assert!(stop.trigger(1));
        assert!(!stop.trigger(0));
        assert_eq!(stop.exit_code(), Some(1));
    }

    #[test]
    fn test_reset() {
        let stop = StopSignal::new();
        stop.trigger(2);
        stop.reset();
        assert!(!stop.is_set());
        assert!(stop.trigger(0));
        assert_eq!(stop.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_wait_returns_when_already_set() {
        let stop = StopSignal::new();
        stop.trigger(0);
        stop.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_trigger_from_clone() {
        let stop = StopSignal::new();
        let handle = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.trigger(1);
        });

        tokio::time::timeout(Duration::from_secs(5), stop.wait())
            .await
            .expect("stop should fire");
        assert_eq!(stop.exit_code(), Some(1));
    }
}
