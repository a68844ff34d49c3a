use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanosecond monotonic clock, matching spec section 6's
/// `Clock: monotonic_ns()` collaborator interface.
///
/// Abstracted behind a trait so the capture stage's rate gate and fps
/// amortisation can be driven by a fake clock in tests instead of real
/// sleeps.
pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Production clock backed by `std::time::Instant`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// A clock whose value advances only when told to, for deterministic tests
/// of rate gating and fps correction.
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start_ns: u64) -> Self {
        Self { now: AtomicU64::new(start_ns) }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }

    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }
}

impl MonotonicClock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
