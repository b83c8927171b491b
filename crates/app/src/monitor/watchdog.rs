//! Heartbeat watchdog for the pipeline tasks.
//!
//! Each registered task resets its slot every cycle. A slot that stays quiet
//! longer than the timeout marks the task as stalled, and the monitor turns
//! that into a Fatal entry plus a restart request for the supervisor.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::monitor::tasks::TaskId;

pub const WATCHDOG_TIMEOUT_MS: u64 = 5_000;
/// Extra slack granted to a task right after it registers.
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 2_000;

const UNARMED: u64 = u64::MAX;

pub(crate) struct Watchdog {
    timeout_ms: AtomicU64,
    enabled: AtomicBool,
    heartbeats: [AtomicU64; TaskId::ALL.len()],
}

impl Watchdog {
    pub(crate) fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms: AtomicU64::new(timeout_ms),
            enabled: AtomicBool::new(true),
            heartbeats: std::array::from_fn(|_| AtomicU64::new(UNARMED)),
        }
    }

    /// Start watching `task`, granting the startup grace period.
    pub(crate) fn arm(&self, task: TaskId, now_ms: u64) {
        self.heartbeats[task.index()].store(
            now_ms.saturating_add(WATCHDOG_STARTUP_GRACE_MS),
            Ordering::Relaxed,
        );
    }

    pub(crate) fn disarm(&self, task: TaskId) {
        self.heartbeats[task.index()].store(UNARMED, Ordering::Relaxed);
    }

    pub(crate) fn beat(&self, task: TaskId, now_ms: u64) {
        let slot = &self.heartbeats[task.index()];
        if slot.load(Ordering::Relaxed) != UNARMED {
            slot.store(now_ms, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timeout(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// First armed task, in priority order, whose heartbeat is stale.
    pub(crate) fn stale_task(&self, now_ms: u64) -> Option<TaskId> {
        if !self.is_enabled() {
            return None;
        }
        let timeout = self.timeout_ms();
        TaskId::ALL.into_iter().find(|task| {
            let last = self.heartbeats[task.index()].load(Ordering::Relaxed);
            last != UNARMED && now_ms.saturating_sub(last) > timeout
        })
    }
}

/// Latched record of the watchdog firing, read by the supervisor.
pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<TaskId>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, task: TaskId) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(task);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<TaskId> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }

    pub(crate) fn reset(&self) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = None;
        }
        self.triggered.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_period_delays_first_timeout() {
        let watchdog = Watchdog::new(WATCHDOG_TIMEOUT_MS);
        watchdog.arm(TaskId::Inference, 0);
        let deadline = WATCHDOG_STARTUP_GRACE_MS + WATCHDOG_TIMEOUT_MS;
        assert_eq!(watchdog.stale_task(deadline), None);
        assert_eq!(watchdog.stale_task(deadline + 1), Some(TaskId::Inference));
    }

    #[test]
    fn beats_keep_task_alive() {
        let watchdog = Watchdog::new(1_000);
        watchdog.arm(TaskId::Capture, 0);
        watchdog.beat(TaskId::Capture, 10_000);
        assert_eq!(watchdog.stale_task(10_900), None);
        assert_eq!(watchdog.stale_task(11_001), Some(TaskId::Capture));
    }

    #[test]
    fn unarmed_and_disabled_are_ignored() {
        let watchdog = Watchdog::new(1_000);
        watchdog.beat(TaskId::Monitor, 0);
        assert_eq!(watchdog.stale_task(50_000), None);

        watchdog.arm(TaskId::Monitor, 0);
        watchdog.set_enabled(false);
        assert_eq!(watchdog.stale_task(50_000), None);
    }

    #[test]
    fn state_latches_reason_until_reset() {
        let state = WatchdogState::new();
        state.arm(TaskId::Synthesis);
        assert!(state.is_triggered());
        assert_eq!(state.reason(), Some(TaskId::Synthesis));
        state.reset();
        assert!(!state.is_triggered());
    }
}
