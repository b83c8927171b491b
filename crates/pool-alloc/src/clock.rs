//! Time sources shared by every time-dependent component.
//!
//! Latency, block age and watchdog staleness are all measured through the
//! [`Clock`] trait so tests can drive time explicitly with [`ManualClock`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Monotonic time source with microsecond resolution.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Microseconds elapsed since the clock's origin.
    fn now_us(&self) -> u64;

    /// Milliseconds elapsed since the clock's origin.
    fn now_ms(&self) -> u64 {
        self.now_us() / 1_000
    }
}

/// Wall-clock backed implementation anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock. Clones share the same time value.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.micros.fetch_add(us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms.saturating_mul(1_000));
    }

    pub fn set_us(&self, us: u64) {
        self.micros.store(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Shared handle used by components that only read time.
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let view = clock.clone();
        clock.advance_ms(1_500);
        assert_eq!(view.now_ms(), 1_500);
        assert_eq!(view.now_us(), 1_500_000);
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let first = clock.now_us();
        let second = clock.now_us();
        assert!(second >= first);
    }
}
