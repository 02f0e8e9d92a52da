//! # Time Sources
//!
//! Nanosecond clocks used for pacing and probe timestamps. Production code
//! reads a calibrated TSC through `quanta`; tests inject a mocked
//! `quanta::Clock` or a [`StepClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Waits longer than this are slept instead of spun.
const SPIN_THRESHOLD_NS: u64 = 200_000;

// ─── TimeSource ──────────────────────────────────────────────────────────────

/// Monotonic nanosecond clock.
pub trait TimeSource: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed epoch.
    fn now_ns(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

// ─── QuantaClock ─────────────────────────────────────────────────────────────

/// TSC-backed clock. Wraps a `quanta::Clock`, counting from construction.
#[derive(Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    epoch: quanta::Instant,
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::from_clock(quanta::Clock::new())
    }

    /// Use an existing clock, e.g. one from `quanta::Clock::mock()`.
    pub fn from_clock(clock: quanta::Clock) -> Self {
        let epoch = clock.now();
        QuantaClock { clock, epoch }
    }
}

impl Default for QuantaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for QuantaClock {
    fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.epoch).as_nanos() as u64
    }
}

// ─── StepClock ───────────────────────────────────────────────────────────────

/// Deterministic clock that advances by a fixed step on every read.
///
/// Busy-wait loops make progress against it without real time passing,
/// which lets pacing be simulated exactly.
#[derive(Debug)]
pub struct StepClock {
    now: AtomicU64,
    step_ns: u64,
}

impl StepClock {
    pub fn new(step_ns: u64) -> Self {
        StepClock {
            now: AtomicU64::new(0),
            step_ns,
        }
    }

    /// Jump forward without a read.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Current time without stepping.
    pub fn peek_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl TimeSource for StepClock {
    fn now_ns(&self) -> u64 {
        self.now.fetch_add(self.step_ns, Ordering::Relaxed)
    }
}

// ─── Waiting ─────────────────────────────────────────────────────────────────

/// Block until `clock` reaches `deadline_ns`. Long waits sleep, the final
/// stretch spins for precision.
pub fn wait_until<C: TimeSource + ?Sized>(clock: &C, deadline_ns: u64) {
    loop {
        let now = clock.now_ns();
        if now >= deadline_ns {
            return;
        }
        let remaining = deadline_ns - now;
        if remaining > SPIN_THRESHOLD_NS {
            std::thread::sleep(Duration::from_nanos(remaining - SPIN_THRESHOLD_NS / 2));
        } else {
            std::hint::spin_loop();
        }
    }
}
