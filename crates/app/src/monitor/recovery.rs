//! Recovery escalation.
//!
//! Every task keeps a count of consecutive errors. Once the count exceeds
//! [`RECOVERY_ERROR_THRESHOLD`] the monitor runs the task's next recovery
//! level. A failed attempt escalates the level for the following round, a
//! successful one resets it, and the same level is never repeated within
//! [`RECOVERY_COOLDOWN_MS`].

use serde::Serialize;

/// Consecutive errors tolerated before a recovery runs.
pub const RECOVERY_ERROR_THRESHOLD: u32 = 5;
pub const RECOVERY_COOLDOWN_MS: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RecoveryAction {
    None,
    TaskRestart,
    SubsystemReset,
    SystemRestart,
    EmergencyShutdown,
}

impl RecoveryAction {
    pub fn escalate(self) -> Self {
        match self {
            RecoveryAction::None => RecoveryAction::TaskRestart,
            RecoveryAction::TaskRestart => RecoveryAction::SubsystemReset,
            RecoveryAction::SubsystemReset => RecoveryAction::SystemRestart,
            RecoveryAction::SystemRestart | RecoveryAction::EmergencyShutdown => {
                RecoveryAction::EmergencyShutdown
            }
        }
    }
}

/// Subsystem the monitor can drive through recovery.
pub trait Recoverable {
    /// Power-cycle, reinitialize and reload; reset error counters.
    fn restart(&mut self) -> anyhow::Result<()>;

    /// `restart` plus a reset of the memory the subsystem owns.
    fn reset_subsystem(&mut self) -> anyhow::Result<()>;

    fn self_test(&mut self) -> anyhow::Result<()>;

    /// Bring outputs to a safe state immediately.
    fn emergency_stop(&mut self);
}

/// Escalation bookkeeping for one task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecoveryRecord {
    pub consecutive_errors: u32,
    pub next_level: RecoveryAction,
    pub last_level: RecoveryAction,
    pub last_attempt_ms: Option<u64>,
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    /// Action ordered from outside the escalation ladder.
    pub pending: Option<RecoveryAction>,
}

impl Default for RecoveryRecord {
    fn default() -> Self {
        Self {
            consecutive_errors: 0,
            next_level: RecoveryAction::TaskRestart,
            last_level: RecoveryAction::None,
            last_attempt_ms: None,
            attempts: 0,
            successes: 0,
            failures: 0,
            pending: None,
        }
    }
}

impl RecoveryRecord {
    /// Count an error; true once the threshold is exceeded.
    pub fn note_error(&mut self) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.consecutive_errors > RECOVERY_ERROR_THRESHOLD
    }

    pub fn note_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Level to run now, honouring the cool-down on the previous level.
    pub fn plan(&self, now_ms: u64) -> RecoveryAction {
        let level = self.next_level;
        match self.last_attempt_ms {
            Some(at)
                if self.last_level == level
                    && now_ms.saturating_sub(at) < RECOVERY_COOLDOWN_MS =>
            {
                level.escalate()
            }
            _ => level,
        }
    }

    pub fn complete(&mut self, level: RecoveryAction, now_ms: u64, succeeded: bool) {
        self.consecutive_errors = 0;
        self.attempts += 1;
        self.last_level = level;
        self.last_attempt_ms = Some(now_ms);
        if succeeded {
            self.successes += 1;
            self.next_level = RecoveryAction::TaskRestart;
        } else {
            self.failures += 1;
            self.next_level = level.escalate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_exceeded_on_sixth_error() {
        let mut record = RecoveryRecord::default();
        let triggers: Vec<bool> = (0..6).map(|_| record.note_error()).collect();
        assert_eq!(triggers, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn failure_escalates_and_success_resets() {
        let mut record = RecoveryRecord::default();
        record.complete(RecoveryAction::TaskRestart, 0, false);
        assert_eq!(record.next_level, RecoveryAction::SubsystemReset);
        assert_eq!(record.consecutive_errors, 0);

        record.complete(RecoveryAction::SubsystemReset, 20_000, true);
        assert_eq!(record.next_level, RecoveryAction::TaskRestart);
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn same_level_inside_cooldown_escalates() {
        let mut record = RecoveryRecord::default();
        record.complete(RecoveryAction::TaskRestart, 1_000, true);
        assert_eq!(record.plan(5_000), RecoveryAction::SubsystemReset);
        assert_eq!(record.plan(11_000), RecoveryAction::TaskRestart);
    }

    #[test]
    fn emergency_shutdown_is_the_ceiling() {
        assert_eq!(
            RecoveryAction::EmergencyShutdown.escalate(),
            RecoveryAction::EmergencyShutdown
        );
    }
}
