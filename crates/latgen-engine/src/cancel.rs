//! # Cooperative Cancellation
//!
//! A cloneable run token replacing a process-wide "running" flag. Loops poll
//! [`RunToken::is_running`] at iteration boundaries; nothing is preempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RunToken {
    running: Arc<AtomicBool>,
    /// Set for child tokens; cancelling the parent stops the child too.
    parent: Option<Arc<AtomicBool>>,
}

impl RunToken {
    pub fn new() -> Self {
        RunToken {
            running: Arc::new(AtomicBool::new(true)),
            parent: None,
        }
    }

    /// A token that stops when either it or `self` is cancelled. Cancelling
    /// the child leaves `self` running.
    pub fn child(&self) -> RunToken {
        RunToken {
            running: Arc::new(AtomicBool::new(true)),
            parent: Some(self.running.clone()),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self
                .parent
                .as_ref()
                .is_none_or(|p| p.load(Ordering::Relaxed))
    }

    /// Stop every loop holding a clone of this token. Idempotent.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Sleep for `duration`, waking early on cancellation.
    /// Returns `true` if the full duration elapsed while still running.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
        false
    }

    /// Cancel the token once `after` has elapsed (runtime limit).
    pub fn cancel_after(&self, after: Duration) -> thread::JoinHandle<()> {
        let token = self.clone();
        thread::Builder::new()
            .name("latgen-timer".into())
            .spawn(move || {
                if token.sleep(after) {
                    tracing::info!(runtime_s = after.as_secs_f64(), "runtime elapsed, stopping");
                    token.cancel();
                }
            })
            .expect("failed to spawn runtime timer")
    }
}

impl Default for RunToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = RunToken::new();
        let other = token.clone();
        assert!(other.is_running());
        token.cancel();
        assert!(!other.is_running());
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = RunToken::new();
        let canceller = token.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        h.join().unwrap();
    }

    #[test]
    fn cancel_after_fires() {
        let token = RunToken::new();
        token.cancel_after(Duration::from_millis(30)).join().unwrap();
        assert!(!token.is_running());
    }

    #[test]
    fn child_follows_parent_but_not_back() {
        let parent = RunToken::new();
        let first = parent.child();
        first.cancel();
        assert!(!first.is_running());
        assert!(parent.is_running());

        let second = parent.child();
        assert!(second.is_running());
        parent.cancel();
        assert!(!second.is_running());
    }
}
