//! System health monitoring, watchdog supervision and recovery coordination.
//!
//! The module is split into focused submodules:
//! - `tasks`: task identities, status table and per-task health.
//! - `error_log`: bounded ring of reported faults.
//! - `state`: system state machine, power modes and resource thresholds.
//! - `recovery`: escalation ladder and the `Recoverable` trait.
//! - `watchdog`: per-task heartbeats and stall detection.
//!
//! [`HealthMonitor`] ties them together behind `&self` methods so every
//! pipeline task can share one instance through an `Arc`.

pub mod error_log;
pub mod recovery;
pub mod state;
pub mod tasks;
mod watchdog;

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::Write as _,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use pool_alloc::{PoolAllocator, SharedClock};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub use error_log::{ERROR_LOG_CAPACITY, ErrorCode, ErrorEntry, ErrorStats, Severity};
pub use recovery::{
    RECOVERY_COOLDOWN_MS, RECOVERY_ERROR_THRESHOLD, Recoverable, RecoveryAction, RecoveryRecord,
};
pub use state::{EmergencyCause, PowerMode, ResourceSample, SystemState, Thresholds};
pub use tasks::{MAX_TASKS, TaskHealth, TaskId, TaskState, TaskStatus};
pub use watchdog::{WATCHDOG_STARTUP_GRACE_MS, WATCHDOG_TIMEOUT_MS};

use crate::monitor::{
    error_log::ErrorLog,
    tasks::TaskTable,
    watchdog::{Watchdog, WatchdogState},
};

/// Samples kept in the performance history ring.
pub const PERFORMANCE_HISTORY_LEN: usize = 60;
/// Window over which logged errors lower the health score.
const HEALTH_ERROR_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("task table full ({MAX_TASKS} entries)")]
    TableFull,
    #[error("task {0:?} already registered")]
    AlreadyRegistered(TaskId),
    #[error("task {0:?} is not registered")]
    UnknownTask(TaskId),
    #[error("no transition from {from:?} to {to:?}")]
    InvalidTransition { from: SystemState, to: SystemState },
    #[error("power mode is locked while in an emergency")]
    PowerModeLocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub timestamp_ms: u64,
    pub resources: ResourceSample,
    pub state: SystemState,
    pub health_score: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub task: TaskId,
    pub action: RecoveryAction,
    pub succeeded: bool,
    pub detail: Option<String>,
}

/// Hardware readings the monitor cannot derive from the pipeline itself.
pub trait SensorProbe: Send {
    fn temperature_c(&mut self) -> f32;
    fn supply_mv(&mut self) -> u32;
}

/// Probe reporting a cool board on a healthy supply.
#[derive(Clone, Copy, Debug)]
pub struct NominalSensors {
    pub temperature_c: f32,
    pub supply_mv: u32,
}

impl Default for NominalSensors {
    fn default() -> Self {
        let nominal = ResourceSample::default();
        Self {
            temperature_c: nominal.temperature_c,
            supply_mv: nominal.supply_mv,
        }
    }
}

impl SensorProbe for NominalSensors {
    fn temperature_c(&mut self) -> f32 {
        self.temperature_c
    }

    fn supply_mv(&mut self) -> u32 {
        self.supply_mv
    }
}

/// What one monitor cycle observed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CycleReport {
    pub state: SystemState,
    pub leaks_found: u32,
    pub stalled_task: Option<TaskId>,
}

/// Serializable view of the monitor for state dumps.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorSnapshot {
    pub state: SystemState,
    pub power_mode: PowerMode,
    pub health_score: u8,
    pub tasks: Vec<TaskStatus>,
    pub recovery: BTreeMap<TaskId, RecoveryRecord>,
    pub error_stats: ErrorStats,
    pub recent_errors: Vec<ErrorEntry>,
    pub last_sample: Option<PerformanceSample>,
    pub watchdog_enabled: bool,
    pub watchdog_timeout_ms: u64,
    pub thermal_throttled: bool,
    pub thermal_throttle_count: u32,
}

pub type CriticalHook = Box<dyn Fn(&ErrorEntry) + Send + Sync>;

struct MonitorInner {
    tasks: TaskTable,
    log: ErrorLog,
    recovery: BTreeMap<TaskId, RecoveryRecord>,
    state: SystemState,
    power_mode: PowerMode,
    thresholds: Thresholds,
    history: VecDeque<PerformanceSample>,
    restart_reason: Option<String>,
    /// Power mode to restore once the board cools, while throttled.
    throttled_from: Option<PowerMode>,
    thermal_throttle_count: u32,
}

pub struct HealthMonitor {
    clock: SharedClock,
    inner: Mutex<MonitorInner>,
    watchdog: Watchdog,
    watchdog_state: WatchdogState,
    restart_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    critical_hook: Mutex<Option<CriticalHook>>,
}

impl HealthMonitor {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_thresholds(clock, Thresholds::default())
    }

    pub fn with_thresholds(clock: SharedClock, thresholds: Thresholds) -> Self {
        Self {
            clock,
            inner: Mutex::new(MonitorInner {
                tasks: TaskTable::default(),
                log: ErrorLog::default(),
                recovery: BTreeMap::new(),
                state: SystemState::Initializing,
                power_mode: PowerMode::default(),
                thresholds,
                history: VecDeque::with_capacity(PERFORMANCE_HISTORY_LEN),
                restart_reason: None,
                throttled_from: None,
                thermal_throttle_count: 0,
            }),
            watchdog: Watchdog::new(WATCHDOG_TIMEOUT_MS),
            watchdog_state: WatchdogState::new(),
            restart_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            critical_hook: Mutex::new(None),
        }
    }

    pub fn shared(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ---- task table -------------------------------------------------------

    pub fn register_task(&self, id: TaskId) -> Result<(), MonitorError> {
        let now = self.now_ms();
        let mut inner = self.lock();
        inner.tasks.register(id, now)?;
        inner.recovery.entry(id).or_default();
        self.watchdog.arm(id, now);
        Ok(())
    }

    pub fn unregister_task(&self, id: TaskId) -> Result<TaskStatus, MonitorError> {
        let status = self.lock().tasks.unregister(id)?;
        self.watchdog.disarm(id);
        Ok(status)
    }

    /// Record one execution cycle of `id`.
    pub fn update_status(
        &self,
        id: TaskId,
        cpu_percent: u8,
        memory_bytes: usize,
    ) -> Result<(), MonitorError> {
        let now = self.now_ms();
        let mut inner = self.lock();
        let task = inner.tasks.get_mut(id)?;
        task.cpu_percent = cpu_percent.min(100);
        task.memory_bytes = memory_bytes;
        task.last_execution_ms = now;
        Ok(())
    }

    pub fn report_deadline_miss(&self, id: TaskId, overrun_us: u64) {
        self.report_overrun(
            id,
            ErrorCode::DeadlineMiss,
            format!("{} cycle overran by {overrun_us}us", id.label()),
            overrun_us,
        );
    }

    /// Count a missed deadline for `id` and log one warning under `code`.
    pub fn report_overrun(
        &self,
        id: TaskId,
        code: ErrorCode,
        description: impl Into<String>,
        context: u64,
    ) {
        if let Ok(task) = self.lock().tasks.get_mut(id) {
            task.deadline_misses += 1;
        }
        self.log_error(Severity::Warning, id, code, description, context);
    }

    /// Log an error for `id`; true once its consecutive errors call for recovery.
    pub fn report_error(&self, id: TaskId, code: ErrorCode, description: impl Into<String>) -> bool {
        let (trigger, consecutive) = {
            let mut inner = self.lock();
            if let Ok(task) = inner.tasks.get_mut(id) {
                task.error_count += 1;
            }
            let record = inner.recovery.entry(id).or_default();
            (record.note_error(), record.consecutive_errors)
        };
        self.log_error(
            Severity::Error,
            id,
            code,
            description,
            u64::from(consecutive),
        );
        trigger
    }

    /// A clean cycle ends the run of consecutive errors.
    pub fn report_success(&self, id: TaskId) {
        if let Some(record) = self.lock().recovery.get_mut(&id) {
            record.note_success();
        }
    }

    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn task_health(&self, id: TaskId) -> Option<TaskHealth> {
        self.lock().tasks.get(id).map(TaskStatus::health)
    }

    pub fn all_task_status(&self) -> Vec<TaskStatus> {
        self.lock().tasks.iter().cloned().collect()
    }

    // ---- error log --------------------------------------------------------

    pub fn log_error(
        &self,
        severity: Severity,
        task: TaskId,
        code: ErrorCode,
        description: impl Into<String>,
        context: u64,
    ) {
        let entry = ErrorEntry {
            timestamp_ms: self.now_ms(),
            severity,
            task,
            code,
            description: description.into(),
            context,
        };
        match severity {
            Severity::Info => info!(task = task.label(), %code, context, "{}", entry.description),
            Severity::Warning => {
                warn!(task = task.label(), %code, context, "{}", entry.description)
            }
            Severity::Error | Severity::Critical | Severity::Fatal => {
                error!(task = task.label(), %code, ?severity, context, "{}", entry.description)
            }
        }
        metrics::counter!("monitor_errors_total", "severity" => format!("{severity:?}"))
            .increment(1);

        let escalate = severity >= Severity::Critical;
        self.lock().log.push(entry.clone());
        if escalate {
            let hook = self.critical_hook.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(hook) = hook.as_ref() {
                hook(&entry);
            }
        }
    }

    /// Retained entries, oldest first.
    pub fn error_log(&self) -> Vec<ErrorEntry> {
        self.lock().log.entries().cloned().collect()
    }

    pub fn latest_error(&self) -> Option<ErrorEntry> {
        self.lock().log.latest().cloned()
    }

    pub fn clear_error_log(&self) {
        self.lock().log.clear();
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.lock().log.stats()
    }

    /// Called for every Critical or Fatal entry.
    pub fn set_critical_hook(&self, hook: impl Fn(&ErrorEntry) + Send + Sync + 'static) {
        *self.critical_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    // ---- watchdog ---------------------------------------------------------

    pub fn watchdog_reset(&self, id: TaskId) {
        self.watchdog.beat(id, self.now_ms());
    }

    pub fn enable_watchdog(&self, enabled: bool) {
        self.watchdog.set_enabled(enabled);
    }

    pub fn set_watchdog_timeout(&self, timeout_ms: u64) {
        self.watchdog.set_timeout(timeout_ms);
    }

    /// Raise a Fatal fault and a restart request for the first stalled task.
    pub fn check_watchdog(&self) -> Option<TaskId> {
        let stalled = self.watchdog.stale_task(self.now_ms())?;
        if self.watchdog_state.is_triggered() {
            return Some(stalled);
        }
        self.watchdog_state.arm(stalled);
        if let Ok(task) = self.lock().tasks.get_mut(stalled) {
            task.state = TaskState::Faulted;
        }
        self.log_error(
            Severity::Fatal,
            stalled,
            ErrorCode::WatchdogTimeout,
            format!("{} stopped resetting the watchdog", stalled.label()),
            self.watchdog.timeout_ms(),
        );
        self.request_restart(format!("watchdog: {} stalled", stalled.label()));
        Some(stalled)
    }

    // ---- system state -----------------------------------------------------

    pub fn system_state(&self) -> SystemState {
        self.lock().state
    }

    pub fn transition(&self, to: SystemState) -> Result<(), MonitorError> {
        let mut inner = self.lock();
        Self::apply_transition(&mut inner, to)
    }

    fn apply_transition(inner: &mut MonitorInner, to: SystemState) -> Result<(), MonitorError> {
        let from = inner.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(MonitorError::InvalidTransition { from, to });
        }
        info!(?from, ?to, "system state change");
        inner.state = to;
        Ok(())
    }

    pub fn power_mode(&self) -> PowerMode {
        self.lock().power_mode
    }

    pub fn set_power_mode(&self, mode: PowerMode) -> Result<(), MonitorError> {
        let mut inner = self.lock();
        if inner.state == SystemState::Emergency && mode != PowerMode::Emergency {
            return Err(MonitorError::PowerModeLocked);
        }
        inner.power_mode = mode;
        Ok(())
    }

    /// Feed one resource reading through the thresholds.
    pub fn record_sample(&self, sample: ResourceSample) -> SystemState {
        let now = self.now_ms();
        let mut pending_logs: Vec<(Severity, ErrorCode, String, u64)> = Vec::new();
        let state = {
            let mut inner = self.lock();
            let (wanted, cause) = state::assess(&sample, &inner.thresholds);
            match cause {
                Some(cause) => {
                    if inner.state != SystemState::Emergency
                        && Self::apply_transition(&mut inner, SystemState::Emergency).is_ok()
                    {
                        inner.power_mode = PowerMode::Emergency;
                        inner.throttled_from = None;
                        let ids: Vec<TaskId> = inner.tasks.iter().map(|t| t.id).collect();
                        for id in ids {
                            inner.recovery.entry(id).or_default().pending =
                                Some(RecoveryAction::EmergencyShutdown);
                        }
                        pending_logs.push(match cause {
                            EmergencyCause::Thermal => (
                                Severity::Critical,
                                ErrorCode::ThermalEmergency,
                                format!("temperature {:.1}C over limit", sample.temperature_c),
                                sample.temperature_c as u64,
                            ),
                            EmergencyCause::Undervoltage => (
                                Severity::Critical,
                                ErrorCode::PowerEmergency,
                                format!("supply {}mV under limit", sample.supply_mv),
                                u64::from(sample.supply_mv),
                            ),
                        });
                    }
                }
                None => {
                    let hot = sample.temperature_c >= inner.thresholds.temperature_warning_c;
                    if let Some(entry) = Self::apply_throttle(&mut inner, hot, sample.temperature_c) {
                        pending_logs.push(entry);
                    }
                    let current = inner.state;
                    let resource_driven = matches!(
                        current,
                        SystemState::Normal | SystemState::Warning | SystemState::Critical
                    );
                    if resource_driven
                        && wanted != current
                        && Self::apply_transition(&mut inner, wanted).is_ok()
                    {
                        match wanted {
                            SystemState::Warning if hot => {}
                            SystemState::Warning => pending_logs.push((
                                Severity::Warning,
                                ErrorCode::ResourceWarning,
                                format!(
                                    "cpu {}% memory {}%",
                                    sample.cpu_percent, sample.memory_percent
                                ),
                                u64::from(sample.cpu_percent),
                            )),
                            SystemState::Critical => pending_logs.push((
                                Severity::Critical,
                                ErrorCode::ResourceCritical,
                                format!(
                                    "cpu {}% memory {}%",
                                    sample.cpu_percent, sample.memory_percent
                                ),
                                u64::from(sample.cpu_percent),
                            )),
                            _ => {}
                        }
                    }
                }
            }

            let health_score = Self::score(&inner, now);
            if inner.history.len() == PERFORMANCE_HISTORY_LEN {
                inner.history.pop_front();
            }
            let state = inner.state;
            inner.history.push_back(PerformanceSample {
                timestamp_ms: now,
                resources: sample,
                state,
                health_score,
            });
            metrics::gauge!("monitor_health_score").set(f64::from(health_score));
            metrics::gauge!("monitor_cpu_percent").set(f64::from(sample.cpu_percent));
            state
        };

        let emergency = state == SystemState::Emergency;
        for (severity, code, description, context) in pending_logs {
            self.log_error(severity, TaskId::Monitor, code, description, context);
        }
        if emergency {
            self.request_shutdown();
        }
        state
    }

    /// Enter or leave thermal throttling; returns the log entry for a new throttle.
    fn apply_throttle(
        inner: &mut MonitorInner,
        hot: bool,
        temperature_c: f32,
    ) -> Option<(Severity, ErrorCode, String, u64)> {
        if matches!(inner.state, SystemState::Emergency | SystemState::Shutdown) {
            return None;
        }
        match (hot, inner.throttled_from) {
            (true, None) => {
                inner.throttled_from = Some(inner.power_mode);
                inner.power_mode = PowerMode::PowerSave;
                inner.thermal_throttle_count += 1;
                metrics::counter!("monitor_thermal_throttle_total").increment(1);
                Some((
                    Severity::Warning,
                    ErrorCode::ThermalThrottle,
                    format!("temperature {temperature_c:.1}C, throttling to power save"),
                    temperature_c as u64,
                ))
            }
            (false, Some(previous)) => {
                inner.throttled_from = None;
                if inner.power_mode == PowerMode::PowerSave {
                    inner.power_mode = previous;
                }
                info!(?previous, "thermal throttling lifted");
                None
            }
            _ => None,
        }
    }

    pub fn is_thermal_throttled(&self) -> bool {
        self.lock().throttled_from.is_some()
    }

    pub fn thermal_throttle_count(&self) -> u32 {
        self.lock().thermal_throttle_count
    }

    pub fn performance_history(&self) -> Vec<PerformanceSample> {
        self.lock().history.iter().copied().collect()
    }

    /// One pass of the monitor task: leak sweep, resource sample, watchdog.
    pub fn run_cycle(
        &self,
        pool: &Mutex<PoolAllocator>,
        sensors: &mut dyn SensorProbe,
    ) -> CycleReport {
        let (leaks_found, memory_percent) = match pool.lock() {
            Ok(mut pool) => {
                let leaks = pool.check_leaks();
                (leaks, pool.stats().usage_percent().min(100) as u8)
            }
            Err(_) => (0, 0),
        };
        if leaks_found > 0 {
            self.log_error(
                Severity::Warning,
                TaskId::Monitor,
                ErrorCode::MemoryLeak,
                format!("{leaks_found} pool blocks outlived the leak threshold"),
                u64::from(leaks_found),
            );
        }

        let cpu_percent = self.lock().tasks.total_cpu();
        let state = self.record_sample(ResourceSample {
            cpu_percent,
            memory_percent,
            temperature_c: sensors.temperature_c(),
            supply_mv: sensors.supply_mv(),
        });
        let stalled_task = self.check_watchdog();
        CycleReport {
            state,
            leaks_found,
            stalled_task,
        }
    }

    // ---- recovery ---------------------------------------------------------

    pub fn recovery_record(&self, id: TaskId) -> Option<RecoveryRecord> {
        self.lock().recovery.get(&id).cloned()
    }

    /// Action ordered for `id` outside the escalation ladder, if any.
    pub fn take_pending_action(&self, id: TaskId) -> Option<RecoveryAction> {
        self.lock()
            .recovery
            .get_mut(&id)
            .and_then(|record| record.pending.take())
    }

    /// Run the next escalation level for `id` against `target`.
    pub fn recover(&self, id: TaskId, target: &mut dyn Recoverable) -> RecoveryOutcome {
        let now = self.now_ms();
        let action = self.lock().recovery.entry(id).or_default().plan(now);
        self.execute_recovery(id, action, target)
    }

    pub fn execute_recovery(
        &self,
        id: TaskId,
        action: RecoveryAction,
        target: &mut dyn Recoverable,
    ) -> RecoveryOutcome {
        if action == RecoveryAction::None {
            return RecoveryOutcome {
                task: id,
                action,
                succeeded: true,
                detail: None,
            };
        }

        info!(task = id.label(), ?action, "starting recovery");
        {
            let mut inner = self.lock();
            // Already in Recovery or past the point of no return.
            let _ = Self::apply_transition(&mut inner, SystemState::Recovery);
        }

        let result = match action {
            RecoveryAction::TaskRestart => target.restart().and_then(|()| target.self_test()),
            RecoveryAction::SubsystemReset => {
                target.reset_subsystem().and_then(|()| target.self_test())
            }
            RecoveryAction::SystemRestart => {
                self.request_restart(format!("{} recovery", id.label()));
                Ok(())
            }
            RecoveryAction::EmergencyShutdown => {
                target.emergency_stop();
                self.request_shutdown();
                Ok(())
            }
            RecoveryAction::None => Ok(()),
        };

        let succeeded = result.is_ok();
        let detail = result.err().map(|err| format!("{err:#}"));
        let now = self.now_ms();
        {
            let mut inner = self.lock();
            inner
                .recovery
                .entry(id)
                .or_default()
                .complete(action, now, succeeded);
            if let Ok(task) = inner.tasks.get_mut(id) {
                task.state = if succeeded {
                    TaskState::Running
                } else {
                    TaskState::Faulted
                };
            }
            let next = match (action, succeeded) {
                (RecoveryAction::EmergencyShutdown, _) => SystemState::Shutdown,
                (_, true) => SystemState::Normal,
                (_, false) => SystemState::Critical,
            };
            if inner.state == SystemState::Recovery || next == SystemState::Shutdown {
                let _ = Self::apply_transition(&mut inner, next);
            }
        }

        metrics::counter!(
            "monitor_recovery_total",
            "action" => format!("{action:?}"),
            "outcome" => if succeeded { "ok" } else { "failed" }
        )
        .increment(1);

        if let Some(detail) = detail.as_deref() {
            self.log_error(
                Severity::Critical,
                id,
                ErrorCode::RecoveryFailed,
                format!("{action:?} failed: {detail}"),
                action as u64,
            );
        } else {
            info!(task = id.label(), ?action, "recovery succeeded");
        }

        RecoveryOutcome {
            task: id,
            action,
            succeeded,
            detail,
        }
    }

    // ---- supervisor requests ---------------------------------------------

    pub fn request_restart(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("system restart requested: {reason}");
        self.lock().restart_reason.get_or_insert(reason);
        self.restart_requested.store(true, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Consume a pending restart request, returning its reason.
    pub fn take_restart_request(&self) -> Option<String> {
        if !self.restart_requested.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.watchdog_state.reset();
        let reason = self.lock().restart_reason.take();
        Some(reason.unwrap_or_else(|| "unspecified".into()))
    }

    /// Task the watchdog last found stalled, if it fired.
    pub fn watchdog_reason(&self) -> Option<TaskId> {
        if self.watchdog_state.is_triggered() {
            self.watchdog_state.reason()
        } else {
            None
        }
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("emergency shutdown requested");
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    // ---- reporting --------------------------------------------------------

    fn score(inner: &MonitorInner, now_ms: u64) -> u8 {
        let mut score: i32 = 100;
        score -= match inner.state {
            SystemState::Initializing | SystemState::Normal => 0,
            SystemState::Warning => 10,
            SystemState::Recovery => 20,
            SystemState::Critical => 30,
            SystemState::Emergency => 60,
            SystemState::Shutdown => 100,
        };
        for task in inner.tasks.iter() {
            score -= match task.health() {
                TaskHealth::Healthy => 0,
                TaskHealth::Degraded => 3,
                TaskHealth::Failed => 10,
            };
        }
        let since = now_ms.saturating_sub(HEALTH_ERROR_WINDOW_MS);
        let error_penalty: i32 = inner
            .log
            .entries()
            .filter(|entry| entry.timestamp_ms >= since)
            .map(|entry| match entry.severity {
                Severity::Info | Severity::Warning => 0,
                Severity::Error => 2,
                Severity::Critical => 5,
                Severity::Fatal => 10,
            })
            .sum();
        score -= error_penalty.min(30);
        score.clamp(0, 100) as u8
    }

    /// 0..=100, higher is healthier.
    pub fn health_score(&self) -> u8 {
        let now = self.now_ms();
        Self::score(&self.lock(), now)
    }

    pub fn status_report(&self) -> String {
        let now = self.now_ms();
        let inner = self.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "state {:?} | power {:?} | health {}/100 | uptime {}ms",
            inner.state,
            inner.power_mode,
            Self::score(&inner, now),
            now
        );
        for task in inner.tasks.iter() {
            let _ = writeln!(
                out,
                "  {:<10} p{} {:?} cpu {:>3}% mem {:>8}B misses {} errors {}",
                task.id.label(),
                task.id.priority(),
                task.health(),
                task.cpu_percent,
                task.memory_bytes,
                task.deadline_misses,
                task.error_count
            );
        }
        let stats = inner.log.stats();
        let _ = writeln!(
            out,
            "errors logged {} (retained {}), warnings {}, critical {}, fatal {}",
            stats.total_logged,
            stats.retained,
            stats.count(Severity::Warning),
            stats.count(Severity::Critical),
            stats.count(Severity::Fatal)
        );
        if let Some(latest) = inner.log.latest() {
            let _ = writeln!(
                out,
                "last error: [{:?}] {} {}: {}",
                latest.severity,
                latest.task.label(),
                latest.code,
                latest.description
            );
        }
        out
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let now = self.now_ms();
        let inner = self.lock();
        MonitorSnapshot {
            state: inner.state,
            power_mode: inner.power_mode,
            health_score: Self::score(&inner, now),
            tasks: inner.tasks.iter().cloned().collect(),
            recovery: inner.recovery.clone(),
            error_stats: inner.log.stats(),
            recent_errors: inner.log.entries().cloned().collect(),
            last_sample: inner.history.back().copied(),
            watchdog_enabled: self.watchdog.is_enabled(),
            watchdog_timeout_ms: self.watchdog.timeout_ms(),
            thermal_throttled: inner.throttled_from.is_some(),
            thermal_throttle_count: inner.thermal_throttle_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pool_alloc::ManualClock;

    use super::*;

    fn monitor() -> (HealthMonitor, ManualClock) {
        let clock = ManualClock::new();
        (HealthMonitor::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn watchdog_timeout_logs_fatal_and_requests_restart() {
        let (monitor, clock) = monitor();
        monitor.register_task(TaskId::Inference).unwrap();
        clock.advance_ms(WATCHDOG_STARTUP_GRACE_MS + WATCHDOG_TIMEOUT_MS + 1);

        assert_eq!(monitor.check_watchdog(), Some(TaskId::Inference));
        let latest = monitor.latest_error().unwrap();
        assert_eq!(latest.severity, Severity::Fatal);
        assert_eq!(latest.code, ErrorCode::WatchdogTimeout);
        assert!(monitor.restart_requested());
        assert_eq!(monitor.watchdog_reason(), Some(TaskId::Inference));
        // Counter-based escalation is bypassed.
        assert_eq!(
            monitor
                .recovery_record(TaskId::Inference)
                .unwrap()
                .consecutive_errors,
            0
        );
        assert!(monitor.take_restart_request().unwrap().contains("inference"));
        assert!(!monitor.restart_requested());
    }

    #[test]
    fn disabled_watchdog_ignores_stalls_until_reenabled() {
        let (monitor, clock) = monitor();
        monitor.register_task(TaskId::Synthesis).unwrap();
        monitor.enable_watchdog(false);
        clock.advance_ms(WATCHDOG_STARTUP_GRACE_MS + WATCHDOG_TIMEOUT_MS + 1);

        assert_eq!(monitor.check_watchdog(), None);
        assert!(!monitor.restart_requested());
        assert!(!monitor.snapshot().watchdog_enabled);

        monitor.enable_watchdog(true);
        assert_eq!(monitor.check_watchdog(), Some(TaskId::Synthesis));
    }

    #[test]
    fn shorter_watchdog_timeout_fires_sooner() {
        let (monitor, clock) = monitor();
        monitor.register_task(TaskId::Actuation).unwrap();
        monitor.set_watchdog_timeout(500);
        assert_eq!(monitor.snapshot().watchdog_timeout_ms, 500);

        clock.advance_ms(WATCHDOG_STARTUP_GRACE_MS);
        monitor.watchdog_reset(TaskId::Actuation);
        clock.advance_ms(500);
        assert_eq!(monitor.check_watchdog(), None);
        clock.advance_ms(1);
        assert_eq!(monitor.check_watchdog(), Some(TaskId::Actuation));
    }

    #[test]
    fn clearing_the_log_drops_entries_and_counters() {
        let (monitor, _) = monitor();
        for n in 0..3 {
            monitor.log_error(
                Severity::Warning,
                TaskId::Capture,
                ErrorCode::CaptureFault,
                format!("fault {n}"),
                n,
            );
        }
        assert_eq!(monitor.error_stats().total_logged, 3);

        monitor.clear_error_log();

        assert!(monitor.error_log().is_empty());
        assert!(monitor.latest_error().is_none());
        assert_eq!(monitor.error_stats().count(Severity::Warning), 0);
    }

    #[test]
    fn resource_thresholds_drive_state() {
        let (monitor, _) = monitor();
        monitor.transition(SystemState::Normal).unwrap();
        let sample = |cpu| ResourceSample {
            cpu_percent: cpu,
            ..ResourceSample::default()
        };
        assert_eq!(monitor.record_sample(sample(85)), SystemState::Warning);
        assert_eq!(monitor.record_sample(sample(96)), SystemState::Critical);
        assert_eq!(monitor.record_sample(sample(20)), SystemState::Normal);
        assert_eq!(monitor.performance_history().len(), 3);
    }

    #[test]
    fn thermal_emergency_orders_emergency_shutdown() {
        let (monitor, _) = monitor();
        monitor.register_task(TaskId::Actuation).unwrap();
        monitor.transition(SystemState::Normal).unwrap();
        let state = monitor.record_sample(ResourceSample {
            temperature_c: 90.0,
            ..ResourceSample::default()
        });
        assert_eq!(state, SystemState::Emergency);
        assert_eq!(monitor.power_mode(), PowerMode::Emergency);
        assert!(monitor.shutdown_requested());
        assert_eq!(
            monitor.take_pending_action(TaskId::Actuation),
            Some(RecoveryAction::EmergencyShutdown)
        );
        assert_eq!(monitor.take_pending_action(TaskId::Actuation), None);
        assert_eq!(
            monitor.set_power_mode(PowerMode::HighPerformance),
            Err(MonitorError::PowerModeLocked)
        );
    }

    #[test]
    fn warm_board_is_throttled_until_it_cools() {
        let (monitor, _) = monitor();
        monitor.transition(SystemState::Normal).unwrap();
        monitor.set_power_mode(PowerMode::HighPerformance).unwrap();
        let at = |temperature_c| ResourceSample {
            temperature_c,
            ..ResourceSample::default()
        };

        assert_eq!(monitor.record_sample(at(78.0)), SystemState::Warning);
        assert!(monitor.is_thermal_throttled());
        assert_eq!(monitor.power_mode(), PowerMode::PowerSave);
        assert_eq!(monitor.record_sample(at(79.0)), SystemState::Warning);
        assert_eq!(monitor.thermal_throttle_count(), 1);
        let throttles = monitor
            .error_log()
            .iter()
            .filter(|entry| entry.code == ErrorCode::ThermalThrottle)
            .count();
        assert_eq!(throttles, 1);

        assert_eq!(monitor.record_sample(at(60.0)), SystemState::Normal);
        assert!(!monitor.is_thermal_throttled());
        assert_eq!(monitor.power_mode(), PowerMode::HighPerformance);
        assert!(!monitor.shutdown_requested());

        monitor.record_sample(at(76.0));
        assert_eq!(monitor.thermal_throttle_count(), 2);
        assert!(monitor.snapshot().thermal_throttled);
    }

    #[test]
    fn critical_hook_sees_critical_entries_only() {
        let (monitor, _) = monitor();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        monitor.set_critical_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        monitor.log_error(Severity::Warning, TaskId::Capture, ErrorCode::CaptureFault, "w", 0);
        monitor.log_error(Severity::Critical, TaskId::Capture, ErrorCode::CaptureFault, "c", 0);
        monitor.log_error(Severity::Fatal, TaskId::Capture, ErrorCode::CaptureFault, "f", 0);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let (monitor, _) = monitor();
        assert_eq!(
            monitor.transition(SystemState::Warning),
            Err(MonitorError::InvalidTransition {
                from: SystemState::Initializing,
                to: SystemState::Warning
            })
        );
    }

    #[test]
    fn health_score_drops_with_errors() {
        let (monitor, _) = monitor();
        monitor.transition(SystemState::Normal).unwrap();
        let baseline = monitor.health_score();
        monitor.log_error(Severity::Critical, TaskId::Inference, ErrorCode::InferenceFailed, "x", 0);
        assert!(monitor.health_score() < baseline);
        assert!(monitor.status_report().contains("critical 1"));
    }
}
