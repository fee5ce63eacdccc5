//! Interruptible cancellation token for long-running operations.
//!
//! Convergence polls sleep between probe attempts; a bare `thread::sleep`
//! would make cancellation wait out the full interval. `CancelToken` backs
//! the sleep with a `Condvar` so a cancelled operation wakes within
//! milliseconds, checks its position against the commit point, and unwinds
//! from a well-defined phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cooperative cancellation token shared between an operation and its
/// controller. Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    condvar: Condvar,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                reason: Mutex::new(None),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. Wakes all waiters immediately.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut r = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// The reason supplied to the first `cancel()` call, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sleep for at most `duration`, waking immediately on cancellation.
    /// Returns `true` if cancellation was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self.inner.condvar.wait_timeout(guard, duration);
        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn cancel_wakes_waiter_early() {
        let token = CancelToken::new();
        let token_clone = token.clone();

        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = token_clone.wait_timeout(Duration::from_secs(30));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel("operator abort");

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5), "woke early, not after 30s");
        assert_eq!(token.reason().as_deref(), Some("operator abort"));
    }

    #[test]
    fn timeout_without_cancel_returns_false() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn first_cancel_reason_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }
}
