use serde::Serialize;

use crate::monitor::MonitorError;

/// Task table capacity.
pub const MAX_TASKS: usize = 8;

/// Pipeline tasks, declared in descending scheduling priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TaskId {
    Capture,
    Inference,
    Synthesis,
    Actuation,
    Monitor,
}

impl TaskId {
    pub const ALL: [TaskId; 5] = [
        TaskId::Capture,
        TaskId::Inference,
        TaskId::Synthesis,
        TaskId::Actuation,
        TaskId::Monitor,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TaskId::Capture => "capture",
            TaskId::Inference => "inference",
            TaskId::Synthesis => "synthesis",
            TaskId::Actuation => "actuation",
            TaskId::Monitor => "monitor",
        }
    }

    /// 1 is the most urgent.
    pub fn priority(self) -> u8 {
        self as u8 + 1
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Running,
    Faulted,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskHealth {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: TaskState,
    pub cpu_percent: u8,
    pub memory_bytes: usize,
    pub deadline_misses: u32,
    pub error_count: u32,
    pub registered_at_ms: u64,
    pub last_execution_ms: u64,
}

impl TaskStatus {
    fn new(id: TaskId, now_ms: u64) -> Self {
        Self {
            id,
            state: TaskState::Running,
            cpu_percent: 0,
            memory_bytes: 0,
            deadline_misses: 0,
            error_count: 0,
            registered_at_ms: now_ms,
            last_execution_ms: now_ms,
        }
    }

    pub fn health(&self) -> TaskHealth {
        match self.state {
            TaskState::Faulted | TaskState::Stopped => TaskHealth::Failed,
            TaskState::Running if self.deadline_misses > 0 || self.error_count > 0 => {
                TaskHealth::Degraded
            }
            TaskState::Running => TaskHealth::Healthy,
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskTable {
    entries: Vec<TaskStatus>,
}

impl TaskTable {
    pub fn register(&mut self, id: TaskId, now_ms: u64) -> Result<(), MonitorError> {
        if self.get(id).is_some() {
            return Err(MonitorError::AlreadyRegistered(id));
        }
        if self.entries.len() >= MAX_TASKS {
            return Err(MonitorError::TableFull);
        }
        self.entries.push(TaskStatus::new(id, now_ms));
        Ok(())
    }

    pub fn unregister(&mut self, id: TaskId) -> Result<TaskStatus, MonitorError> {
        let at = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(MonitorError::UnknownTask(id))?;
        Ok(self.entries.remove(at))
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskStatus> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskStatus, MonitorError> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(MonitorError::UnknownTask(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskStatus> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of per-task CPU shares, capped at 100.
    pub fn total_cpu(&self) -> u8 {
        self.entries
            .iter()
            .map(|entry| u32::from(entry.cpu_percent))
            .sum::<u32>()
            .min(100) as u8
    }
}
