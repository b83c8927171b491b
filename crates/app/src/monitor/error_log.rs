//! Bounded log of faults reported by the pipeline tasks.

use std::{collections::VecDeque, fmt};

use serde::Serialize;

use crate::monitor::tasks::TaskId;

pub const ERROR_LOG_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl Severity {
    pub const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    InferenceTimeout,
    InferenceFailed,
    ModelLoadFailed,
    DeadlineMiss,
    CaptureFault,
    QueueOverflow,
    SpeechFailed,
    ActuatorFault,
    ResourceWarning,
    ResourceCritical,
    ThermalThrottle,
    ThermalEmergency,
    PowerEmergency,
    WatchdogTimeout,
    MemoryLeak,
    RecoveryFailed,
    LowUtilization,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub timestamp_ms: u64,
    pub severity: Severity,
    pub task: TaskId,
    pub code: ErrorCode,
    pub description: String,
    /// Code-specific detail, e.g. the measured latency.
    pub context: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub total_logged: u64,
    pub retained: usize,
    pub by_severity: [u64; Severity::COUNT],
}

impl ErrorStats {
    pub fn count(&self, severity: Severity) -> u64 {
        self.by_severity[severity.index()]
    }
}

#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: VecDeque<ErrorEntry>,
    stats: ErrorStats,
}

impl ErrorLog {
    pub fn push(&mut self, entry: ErrorEntry) {
        if self.entries.len() == ERROR_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.stats.total_logged += 1;
        self.stats.by_severity[entry.severity.index()] += 1;
        self.entries.push_back(entry);
        self.stats.retained = self.entries.len();
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&ErrorEntry> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.stats = ErrorStats::default();
    }

    pub fn stats(&self) -> ErrorStats {
        self.stats.clone()
    }
}
