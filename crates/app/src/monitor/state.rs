use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SystemState {
    Initializing,
    Normal,
    Warning,
    Critical,
    Emergency,
    Recovery,
    Shutdown,
}

impl SystemState {
    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition(self, to: SystemState) -> bool {
        use SystemState::*;
        if self == to {
            return false;
        }
        match self {
            Initializing => matches!(to, Normal | Critical | Emergency | Shutdown),
            Normal | Warning => matches!(
                to,
                Normal | Warning | Critical | Emergency | Recovery | Shutdown
            ),
            Critical => matches!(to, Warning | Normal | Emergency | Recovery | Shutdown),
            Emergency => matches!(to, Recovery | Shutdown),
            Recovery => matches!(to, Normal | Warning | Critical | Emergency | Shutdown),
            Shutdown => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum PowerMode {
    HighPerformance,
    #[default]
    Balanced,
    PowerSave,
    Emergency,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Thresholds {
    pub cpu_warning: u8,
    pub cpu_critical: u8,
    pub memory_warning: u8,
    pub memory_critical: u8,
    /// At or above this the board is throttled into power save.
    pub temperature_warning_c: f32,
    pub temperature_emergency_c: f32,
    pub min_supply_mv: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80,
            cpu_critical: 95,
            memory_warning: 85,
            memory_critical: 95,
            temperature_warning_c: 75.0,
            temperature_emergency_c: 85.0,
            min_supply_mv: 3_000,
        }
    }
}

/// One reading of system resources.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: u8,
    pub memory_percent: u8,
    pub temperature_c: f32,
    pub supply_mv: u32,
}

impl Default for ResourceSample {
    fn default() -> Self {
        Self {
            cpu_percent: 0,
            memory_percent: 0,
            temperature_c: 40.0,
            supply_mv: 3_300,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EmergencyCause {
    Thermal,
    Undervoltage,
}

/// State a sample calls for, before transition rules are applied.
pub fn assess(sample: &ResourceSample, limits: &Thresholds) -> (SystemState, Option<EmergencyCause>) {
    if sample.temperature_c >= limits.temperature_emergency_c {
        return (SystemState::Emergency, Some(EmergencyCause::Thermal));
    }
    if sample.supply_mv < limits.min_supply_mv {
        return (SystemState::Emergency, Some(EmergencyCause::Undervoltage));
    }
    if sample.cpu_percent >= limits.cpu_critical || sample.memory_percent >= limits.memory_critical
    {
        return (SystemState::Critical, None);
    }
    if sample.cpu_percent >= limits.cpu_warning
        || sample.memory_percent >= limits.memory_warning
        || sample.temperature_c >= limits.temperature_warning_c
    {
        return (SystemState::Warning, None);
    }
    (SystemState::Normal, None)
}
