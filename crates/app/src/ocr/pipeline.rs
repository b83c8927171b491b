//! Pipeline supervisor tying together capture, inference, speech, the tactile
//! actuator and the health monitor.
//!
//! Each attempt wires the five tasks around a shared [`PipelineContext`],
//! runs until a stop condition, then joins every thread. The supervisor loop
//! restarts the attempt when the monitor asks for a system restart or a stage
//! disconnects, and stops on emergency shutdown, Ctrl+C, the run deadline or
//! the frame limit.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use frame_ingest::{
    CameraReader, CaptureError, FrameExchange, FrameReady, FrameSource, SensorPattern,
    SyntheticSensor,
};
use npu_runtime::{Accelerator, Script, SimulatedAccelerator};
use pool_alloc::{MonotonicClock, PoolAllocator, SharedClock, SharedPool};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    monitor::{
        ErrorCode, HealthMonitor, MonitorError, NominalSensors, Recoverable, RecoveryAction,
        SensorProbe, Severity, SystemState, TaskId,
    },
    ocr::{
        channels::{Enqueue, ResultQueue, ResultReceiver},
        config::PipelineConfig,
        processing::{InferenceEngine, POOL_CAPACITY_BYTES},
        telemetry,
    },
    output::{
        Actuator, ActuatorError, LogSink, PriorityHandle, SimulatedSolenoid, SpeechSink,
        Synthesizer, TactileDriver, speech::SYNTHESIS_TIMEOUT_US, tactile::DEFAULT_WPM,
    },
};

/// How long a task blocks on its input before re-checking the run flag.
const IDLE_POLL: Duration = Duration::from_millis(20);
const MONITOR_PERIOD: Duration = Duration::from_millis(100);
const SUPERVISOR_POLL: Duration = Duration::from_millis(10);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
/// Window over which a task's busy time is turned into a CPU percentage.
const CPU_WINDOW: Duration = Duration::from_secs(1);

static CTRL_HANDLER: Once = Once::new();
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// State shared by every task of one pipeline run.
///
/// The monitor and the pool outlive individual attempts so error history and
/// recovery escalation carry across supervisor restarts.
#[derive(Clone)]
pub struct PipelineContext {
    pub clock: SharedClock,
    pub pool: SharedPool,
    pub monitor: Arc<HealthMonitor>,
    /// Capture statistics accumulate across attempts.
    pub exchange: Arc<FrameExchange>,
    /// Cleared to stop the current attempt.
    pub running: Arc<AtomicBool>,
}

impl PipelineContext {
    pub fn new(clock: SharedClock) -> Result<Self> {
        let pool = PoolAllocator::shared(POOL_CAPACITY_BYTES, clock.clone())
            .context("failed to create inference memory pool")?;
        Ok(Self {
            monitor: HealthMonitor::shared(clock.clone()),
            clock,
            pool,
            exchange: Arc::new(FrameExchange::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Collaborators behind the hardware traits, rebuilt for every attempt.
pub struct Stages {
    pub source: Box<dyn FrameSource>,
    pub accelerator: Box<dyn Accelerator>,
    pub speech: Box<dyn SpeechSink>,
    pub tactile: Box<dyn TactileDriver>,
    pub sensors: Box<dyn SensorProbe>,
}

impl Stages {
    /// Synthetic sensor, scripted accelerator, logging speech and a solenoid model.
    pub fn simulated(config: &PipelineConfig, clock: &SharedClock) -> Result<Stages> {
        let sensor = SyntheticSensor::new(
            config.inference.camera_width,
            config.inference.camera_height,
            SensorPattern::TextLines {
                ink: 0x0000,
                paper: 0xFFFF,
                line_height: 12,
                gap: 20,
            },
        )?;
        let accelerator = SimulatedAccelerator::new(Script::sample_page(), clock.clone())
            .with_latency(config.accelerator_latency);
        let tactile = if config.realtime_actuation {
            SimulatedSolenoid::realtime()
        } else {
            SimulatedSolenoid::default()
        };
        Ok(Stages {
            source: Box::new(sensor),
            accelerator: Box::new(accelerator),
            speech: Box::new(LogSink::default()),
            tactile: Box::new(tactile),
            sensors: Box::new(NominalSensors::default()),
        })
    }
}

/// Totals across every attempt of a run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    pub attempts: u32,
    pub restart_reasons: Vec<String>,
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub results_forwarded: u64,
    pub results_dropped: u64,
    pub utterances: u64,
    pub messages_tapped: u64,
    pub emergency_shutdown: bool,
    pub final_state: Option<SystemState>,
    pub health_score: u8,
}

/// Result of a single pipeline attempt.
#[derive(Debug, PartialEq, Eq)]
enum PipelineOutcome {
    Graceful,
    Restart(String),
    /// The monitor ordered an emergency shutdown.
    Shutdown,
}

/// Run the pipeline with simulated collaborators, restarting on recoverable faults.
pub fn run(config: PipelineConfig) -> Result<RunReport> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    install_ctrlc_handler();

    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let ctx = PipelineContext::new(clock)?;
    let report = supervise(&config, &ctx, Stages::simulated)?;

    if config.telemetry.print_metrics {
        if let Some(handle) = telemetry::prometheus_handle() {
            println!("{}", handle.render());
        }
    }
    Ok(report)
}

fn install_ctrlc_handler() {
    INTERRUPTED.store(false, Ordering::SeqCst);
    CTRL_HANDLER.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Supervisor loop over [`run_pipeline_once`], building fresh stages per attempt.
pub fn supervise<F>(config: &PipelineConfig, ctx: &PipelineContext, mut build: F) -> Result<RunReport>
where
    F: FnMut(&PipelineConfig, &SharedClock) -> Result<Stages>,
{
    let span = tracing::info_span!(
        "ocr.pipeline",
        width = config.inference.camera_width,
        height = config.inference.camera_height,
        threshold = config.inference.confidence_threshold,
        budget_us = config.inference.max_inference_time_us,
    );
    let _span_guard = span.enter();

    let mut report = RunReport::default();
    let mut restarts: u32 = 0;
    loop {
        if interrupted() {
            break;
        }
        report.attempts += 1;

        let outcome = build(config, &ctx.clock)
            .and_then(|stages| run_pipeline_once(config, ctx, stages, &mut report));
        match outcome {
            Ok(PipelineOutcome::Graceful) => break,
            Ok(PipelineOutcome::Shutdown) => {
                report.emergency_shutdown = true;
                error!("pipeline stopped by emergency shutdown");
                break;
            }
            Ok(PipelineOutcome::Restart(reason)) => {
                restarts = restarts.saturating_add(1);
                warn!("Pipeline restart requested (reason: {reason}), attempt #{restarts}");
                metrics::counter!("ocr_pipeline_restarts_total").increment(1);
                report.restart_reasons.push(reason.clone());
                if restarts > config.max_restarts {
                    bail!("pipeline restarted {restarts} times, giving up (last reason: {reason})");
                }
            }
            Err(err) => {
                error!("OCR pipeline error: {err:?}");
                if interrupted() {
                    break;
                }
                restarts = restarts.saturating_add(1);
                report.restart_reasons.push(format!("{err:#}"));
                if restarts > config.max_restarts {
                    return Err(err.context(format!("pipeline failed after {restarts} attempts")));
                }
            }
        }
        thread::sleep(RESTART_BACKOFF);
    }

    report.final_state = Some(ctx.monitor.system_state());
    report.health_score = ctx.monitor.health_score();
    info!(
        attempts = report.attempts,
        frames = report.frames_processed,
        forwarded = report.results_forwarded,
        "pipeline stopped"
    );
    Ok(report)
}

/// What the inference task hands back when it exits.
#[derive(Default)]
struct InferenceSummary {
    processed: u64,
    forwarded: u64,
    dropped: u64,
    restart_reason: Option<String>,
    /// The capture side finished on its own (frame limit).
    capture_finished: bool,
}

/// Execute the pipeline once, returning whether to exit or restart.
fn run_pipeline_once(
    config: &PipelineConfig,
    ctx: &PipelineContext,
    stages: Stages,
    report: &mut RunReport,
) -> Result<PipelineOutcome> {
    let monitor = &ctx.monitor;
    if monitor.shutdown_requested() {
        return Ok(PipelineOutcome::Shutdown);
    }

    let Stages {
        source,
        accelerator,
        speech,
        tactile,
        sensors,
    } = stages;

    let mut engine = InferenceEngine::new(
        accelerator,
        ctx.pool.clone(),
        ctx.clock.clone(),
        monitor.clone(),
        config.inference.clone(),
    );
    engine
        .init()
        .context("inference engine failed to initialise")?;
    if monitor.system_state() == SystemState::Initializing {
        monitor
            .transition(SystemState::Normal)
            .context("monitor refused to leave Initializing")?;
    }

    for task in TaskId::ALL {
        match monitor.register_task(task) {
            Ok(()) | Err(MonitorError::AlreadyRegistered(_)) => {}
            Err(err) => return Err(err).context("failed to register pipeline task"),
        }
    }

    ctx.running.store(true, Ordering::SeqCst);
    let exchange = ctx.exchange.clone();
    let (speech_queue, speech_rx) = ResultQueue::bounded("speech");
    let (tactile_queue, tactile_rx) = ResultQueue::bounded("tactile");

    let mut actuator = Actuator::new(HeartbeatDriver {
        inner: tactile,
        monitor: monitor.clone(),
    });
    let priority = actuator.priority_handle();
    let synthesizer = Synthesizer::new(
        speech,
        config.inference.confidence_threshold,
        ctx.clock.clone(),
    );
    actuator.set_speed(DEFAULT_WPM);

    // Spawned lowest priority first so producers never start without consumers.
    let monitor_handle = {
        let ctx = ctx.clone();
        telemetry::spawn_thread("monitor", move || monitor_loop(&ctx, sensors))
            .context("failed to spawn monitor task")?
    };
    let actuation_handle = {
        let ctx = ctx.clone();
        telemetry::spawn_thread("actuation", move || {
            actuation_loop(&ctx, actuator, tactile_rx)
        })
        .context("failed to spawn actuation task")?
    };
    let synthesis_handle = {
        let ctx = ctx.clone();
        telemetry::spawn_thread("synthesis", move || {
            synthesis_loop(&ctx, synthesizer, speech_rx)
        })
        .context("failed to spawn synthesis task")?
    };

    let mut camera = CameraReader::new(source, exchange.clone()).with_period(config.capture_period);
    if let Some(limit) = config.frame_limit {
        camera = camera.with_frame_limit(limit);
    }
    let heartbeat_monitor = monitor.clone();
    let (capture_handle, notices) = match camera.spawn(ctx.running.clone(), move || {
        heartbeat_monitor.watchdog_reset(TaskId::Capture)
    }) {
        Ok(spawned) => spawned,
        Err(err) => {
            abandon_start(
                ctx,
                vec![
                    Box::new(monitor_handle),
                    Box::new(actuation_handle),
                    Box::new(synthesis_handle),
                ],
            );
            return Err(err).context("failed to start capture");
        }
    };

    let spawned = {
        let ctx = ctx.clone();
        let exchange = exchange.clone();
        telemetry::spawn_thread("inference", move || {
            inference_loop(
                &ctx,
                engine,
                &exchange,
                notices,
                speech_queue,
                tactile_queue,
                priority,
            )
        })
    };
    let inference_handle = match spawned {
        Ok(handle) => handle,
        Err(err) => {
            abandon_start(
                ctx,
                vec![
                    Box::new(capture_handle),
                    Box::new(monitor_handle),
                    Box::new(actuation_handle),
                    Box::new(synthesis_handle),
                ],
            );
            return Err(err).context("failed to spawn inference task");
        }
    };

    let deadline = config.run_for.map(|period| Instant::now() + period);
    loop {
        if interrupted() || monitor.shutdown_requested() {
            break;
        }
        if !ctx.is_running() || inference_handle.is_finished() {
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            debug!("run duration elapsed");
            break;
        }
        thread::sleep(SUPERVISOR_POLL);
    }

    // A finished inference task closes the result queues, letting the
    // consumers drain what is left before the run flag drops.
    let drain = inference_handle.is_finished() && ctx.is_running();
    if !drain {
        ctx.stop();
    }
    let summary = inference_handle.join().unwrap_or_else(|_| InferenceSummary {
        restart_reason: Some("inference task panicked".into()),
        ..InferenceSummary::default()
    });
    let utterances = synthesis_handle.join().unwrap_or_default();
    let tapped = actuation_handle.join().unwrap_or_default();
    ctx.stop();
    if capture_handle.join().is_err() {
        error!("capture task panicked");
    }
    if monitor_handle.join().is_err() {
        error!("monitor task panicked");
    }
    unregister_all(monitor);

    report.frames_captured = exchange.stats().captured;
    report.frames_processed += summary.processed;
    report.results_forwarded += summary.forwarded;
    report.results_dropped += summary.dropped;
    report.utterances += utterances;
    report.messages_tapped += tapped;

    if monitor.shutdown_requested() {
        return Ok(PipelineOutcome::Shutdown);
    }
    if interrupted() {
        return Ok(PipelineOutcome::Graceful);
    }
    if let Some(reason) = monitor.take_restart_request() {
        return Ok(PipelineOutcome::Restart(reason));
    }
    if let Some(reason) = summary.restart_reason {
        return Ok(PipelineOutcome::Restart(reason));
    }
    if !summary.capture_finished && deadline.is_none() {
        return Ok(PipelineOutcome::Restart("pipeline stopped unexpectedly".into()));
    }
    Ok(PipelineOutcome::Graceful)
}

fn unregister_all(monitor: &HealthMonitor) {
    for task in TaskId::ALL {
        let _ = monitor.unregister_task(task);
    }
}

/// A started task thread, joined regardless of what it returns.
trait StartedTask {
    fn join_stopped(self: Box<Self>);
}

impl<T> StartedTask for thread::JoinHandle<T> {
    fn join_stopped(self: Box<Self>) {
        let name = self.thread().name().unwrap_or("task").to_string();
        if (*self).join().is_err() {
            warn!(task = %name, "task panicked while start-up was abandoned");
        }
    }
}

/// Stop and join the tasks an attempt already started when a later start-up step fails.
fn abandon_start(ctx: &PipelineContext, started: Vec<Box<dyn StartedTask>>) {
    ctx.stop();
    for task in started {
        task.join_stopped();
    }
    unregister_all(&ctx.monitor);
}

/// Run any action the monitor queued for `task` outside the escalation ladder.
///
/// Returns true when the task must stop serving.
fn apply_pending(monitor: &HealthMonitor, task: TaskId, target: &mut dyn Recoverable) -> bool {
    let Some(action) = monitor.take_pending_action(task) else {
        return false;
    };
    let outcome = monitor.execute_recovery(task, action, target);
    debug!(task = task.label(), ?outcome, "pending recovery executed");
    action == RecoveryAction::EmergencyShutdown
}

/// Busy-time accounting turned into a CPU percentage once per window.
struct CpuMeter {
    window_start: Instant,
    busy: Duration,
}

impl CpuMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            busy: Duration::ZERO,
        }
    }

    fn add_busy(&mut self, busy: Duration) {
        self.busy += busy;
    }

    fn sample(&mut self) -> Option<u8> {
        let elapsed = self.window_start.elapsed();
        if elapsed < CPU_WINDOW {
            return None;
        }
        let percent = (self.busy.as_secs_f64() / elapsed.as_secs_f64() * 100.0).min(100.0);
        self.window_start = Instant::now();
        self.busy = Duration::ZERO;
        Some(percent as u8)
    }
}

fn report_usage(monitor: &HealthMonitor, task: TaskId, meter: &mut CpuMeter, memory_bytes: usize) {
    if let Some(cpu) = meter.sample() {
        if let Err(err) = monitor.update_status(task, cpu, memory_bytes) {
            debug!(task = task.label(), "status update rejected: {err}");
        }
    }
}

fn inference_loop<A: Accelerator>(
    ctx: &PipelineContext,
    mut engine: InferenceEngine<A>,
    exchange: &FrameExchange,
    notices: Receiver<Result<FrameReady, CaptureError>>,
    speech: ResultQueue,
    tactile: ResultQueue,
    priority: PriorityHandle,
) -> InferenceSummary {
    let monitor = &ctx.monitor;
    let mut summary = InferenceSummary::default();
    let mut meter = CpuMeter::new();

    while ctx.is_running() {
        monitor.watchdog_reset(TaskId::Inference);
        if apply_pending(monitor, TaskId::Inference, &mut engine) {
            break;
        }

        let mut capture_closed = false;
        match notices.recv_timeout(IDLE_POLL) {
            Ok(notice) => {
                // Older notices refer to frames the exchange already replaced.
                for notice in std::iter::once(notice).chain(notices.try_iter()) {
                    if let Err(err) = notice {
                        report_capture_fault(monitor, &err);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => capture_closed = true,
        }

        if let Some(lease) = exchange.get_available_frame() {
            let started = Instant::now();
            let frame_span = tracing::info_span!("ocr.frame", frame = lease.sequence());
            let forwarded = frame_span.in_scope(|| engine.run_cycle(&lease));
            exchange.release_frame(lease);
            summary.processed += 1;

            if let Some(result) = forwarded {
                summary.forwarded += 1;
                match speech.push(result.clone()) {
                    Enqueue::Queued => {}
                    Enqueue::Dropped => {
                        summary.dropped += 1;
                        monitor.log_error(
                            Severity::Warning,
                            TaskId::Inference,
                            ErrorCode::QueueOverflow,
                            "speech queue full, result dropped",
                            speech.dropped(),
                        );
                    }
                    Enqueue::Closed => {
                        error!("Speech task terminated unexpectedly");
                        summary.restart_reason = Some("speech queue disconnected".into());
                        break;
                    }
                }
                let urgency = (result.confidence.clamp(0.0, 1.0) * 100.0) as u8;
                match tactile.push(result.clone()) {
                    Enqueue::Queued => {}
                    Enqueue::Dropped => {
                        summary.dropped += 1;
                        if priority.priority_message(result.text, urgency) {
                            debug!(urgency, "tactile backlog, result sent as priority message");
                        }
                    }
                    Enqueue::Closed => {
                        error!("Actuation task terminated unexpectedly");
                        summary.restart_reason = Some("tactile queue disconnected".into());
                        break;
                    }
                }
            }

            meter.add_busy(started.elapsed());
            metrics::histogram!("ocr_stage_latency_seconds", "stage" => "inference_cycle")
                .record(started.elapsed().as_secs_f64());
        }
        report_usage(
            monitor,
            TaskId::Inference,
            &mut meter,
            engine.stats().current_memory_bytes,
        );

        if capture_closed && !exchange.has_pending() {
            summary.capture_finished = true;
            debug!("capture finished, inference task exiting");
            break;
        }
    }

    apply_pending(monitor, TaskId::Inference, &mut engine);
    engine.shutdown();
    summary
}

fn report_capture_fault(monitor: &HealthMonitor, err: &CaptureError) {
    warn!("Capture error: {err}");
    if monitor.report_error(TaskId::Capture, ErrorCode::CaptureFault, err.to_string()) {
        // The sensor lives on the capture thread; only a full restart resets it.
        monitor.request_restart("capture faults");
    }
}

fn synthesis_loop<S: SpeechSink>(
    ctx: &PipelineContext,
    mut synthesizer: Synthesizer<S>,
    rx: ResultReceiver,
) -> u64 {
    let monitor = &ctx.monitor;
    let mut meter = CpuMeter::new();

    while ctx.is_running() {
        monitor.watchdog_reset(TaskId::Synthesis);
        if apply_pending(monitor, TaskId::Synthesis, &mut synthesizer) {
            break;
        }

        let result = match rx.recv_timeout(IDLE_POLL) {
            Ok(Some(result)) => result,
            Ok(None) => {
                report_usage(monitor, TaskId::Synthesis, &mut meter, rx.backlog_bytes());
                continue;
            }
            Err(closed) => {
                debug!("synthesis task exiting: {closed}");
                break;
            }
        };

        let started = Instant::now();
        match synthesizer.handle(&result) {
            Ok(_) => {
                monitor.report_success(TaskId::Synthesis);
                let elapsed_us = synthesizer.stats().last_synthesis_us;
                if elapsed_us > SYNTHESIS_TIMEOUT_US {
                    monitor.report_deadline_miss(
                        TaskId::Synthesis,
                        elapsed_us - SYNTHESIS_TIMEOUT_US,
                    );
                }
            }
            Err(err) => {
                warn!("Speech synthesis failed: {err}");
                if monitor.report_error(TaskId::Synthesis, ErrorCode::SpeechFailed, err.to_string())
                {
                    monitor.recover(TaskId::Synthesis, &mut synthesizer);
                }
            }
        }
        meter.add_busy(started.elapsed());
        report_usage(monitor, TaskId::Synthesis, &mut meter, rx.backlog_bytes());
    }

    apply_pending(monitor, TaskId::Synthesis, &mut synthesizer);
    synthesizer.stats().spoken
}

fn actuation_loop<D: TactileDriver>(
    ctx: &PipelineContext,
    mut actuator: Actuator<D>,
    rx: ResultReceiver,
) -> u64 {
    let monitor = &ctx.monitor;
    let mut meter = CpuMeter::new();

    while ctx.is_running() {
        monitor.watchdog_reset(TaskId::Actuation);
        if apply_pending(monitor, TaskId::Actuation, &mut actuator) {
            break;
        }

        let started = Instant::now();
        let priority = actuator.service_priority();
        if let Err(err) = priority {
            actuator_fault(monitor, &mut actuator, &err);
        }

        match rx.recv_timeout(IDLE_POLL) {
            Ok(Some(result)) => match actuator.play(&result.text) {
                Ok(outcome) => {
                    debug!(?outcome, "tactile message played");
                    monitor.report_success(TaskId::Actuation);
                }
                Err(err) => actuator_fault(monitor, &mut actuator, &err),
            },
            Ok(None) => {}
            Err(closed) => {
                // A message posted just before the queue closed still plays.
                if let Err(err) = actuator.service_priority() {
                    actuator_fault(monitor, &mut actuator, &err);
                }
                debug!("actuation task exiting: {closed}");
                break;
            }
        }
        meter.add_busy(started.elapsed());
        report_usage(monitor, TaskId::Actuation, &mut meter, rx.backlog_bytes());
    }

    apply_pending(monitor, TaskId::Actuation, &mut actuator);
    actuator.stats().messages + actuator.stats().priority_messages
}

fn actuator_fault<D: TactileDriver>(
    monitor: &HealthMonitor,
    actuator: &mut Actuator<D>,
    err: &ActuatorError,
) {
    warn!("Tactile output failed: {err}");
    if monitor.report_error(TaskId::Actuation, ErrorCode::ActuatorFault, err.to_string()) {
        monitor.recover(TaskId::Actuation, actuator);
    }
}

fn monitor_loop(ctx: &PipelineContext, mut sensors: Box<dyn SensorProbe>) {
    let monitor = &ctx.monitor;
    while ctx.is_running() {
        monitor.watchdog_reset(TaskId::Monitor);
        let started = Instant::now();
        let cycle = monitor.run_cycle(&ctx.pool, sensors.as_mut());
        metrics::gauge!("monitor_health_score").set(f64::from(monitor.health_score()));
        if let Some(task) = cycle.stalled_task {
            error!(task = task.label(), "watchdog fired");
        }
        if monitor.restart_requested() || monitor.shutdown_requested() {
            debug!(state = ?cycle.state, "monitor stopping the pipeline");
            ctx.stop();
            break;
        }
        let busy = started.elapsed();
        if let Err(err) = monitor.update_status(
            TaskId::Monitor,
            (busy.as_secs_f64() / MONITOR_PERIOD.as_secs_f64() * 100.0).min(100.0) as u8,
            0,
        ) {
            debug!("monitor status update rejected: {err}");
        }
        thread::sleep(MONITOR_PERIOD.saturating_sub(busy));
    }
    let _ = monitor.take_pending_action(TaskId::Monitor);
}

/// Tactile driver that feeds the watchdog between elements, so long
/// real-time messages do not read as a stalled task.
struct HeartbeatDriver<D> {
    inner: D,
    monitor: Arc<HealthMonitor>,
}

impl<D: TactileDriver> TactileDriver for HeartbeatDriver<D> {
    fn pulse(&mut self, on_ms: u32) -> Result<(), ActuatorError> {
        self.monitor.watchdog_reset(TaskId::Actuation);
        self.inner.pulse(on_ms)
    }

    fn gap(&mut self, ms: u32) {
        self.monitor.watchdog_reset(TaskId::Actuation);
        self.inner.gap(ms);
    }

    fn emergency_stop(&mut self) {
        self.inner.emergency_stop();
    }

    fn self_test(&mut self) -> Result<(), ActuatorError> {
        self.inner.self_test()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_meter_waits_for_a_full_window() {
        let mut meter = CpuMeter::new();
        meter.add_busy(Duration::from_millis(5));
        assert_eq!(meter.sample(), None);
    }

    #[test]
    fn cpu_meter_caps_at_one_hundred() {
        let mut meter = CpuMeter {
            window_start: Instant::now() - CPU_WINDOW,
            busy: CPU_WINDOW * 3,
        };
        assert_eq!(meter.sample(), Some(100));
        assert_eq!(meter.busy, Duration::ZERO);
    }

    #[test]
    fn heartbeat_driver_keeps_the_actuation_slot_fresh() {
        let clock = Arc::new(pool_alloc::ManualClock::new());
        let monitor = HealthMonitor::shared(clock.clone());
        monitor.register_task(TaskId::Actuation).unwrap();
        let mut driver = HeartbeatDriver {
            inner: SimulatedSolenoid::default(),
            monitor: monitor.clone(),
        };
        clock.advance_ms(6_000);
        driver.pulse(200).unwrap();
        clock.advance_ms(4_000);
        assert_eq!(monitor.check_watchdog(), None);
        assert_eq!(driver.inner.activations, 1);
    }

    #[test]
    fn abandoned_start_stops_and_joins_running_tasks() {
        let clock: SharedClock = Arc::new(pool_alloc::ManualClock::new());
        let ctx = PipelineContext::new(clock).unwrap();
        ctx.monitor.register_task(TaskId::Synthesis).unwrap();
        ctx.monitor.register_task(TaskId::Monitor).unwrap();
        ctx.running.store(true, Ordering::SeqCst);

        let spinner = |ctx: PipelineContext| {
            thread::spawn(move || {
                let mut polls = 0u64;
                while ctx.is_running() {
                    polls += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                polls
            })
        };
        let first = spinner(ctx.clone());
        let second = spinner(ctx.clone());
        let quiet = thread::spawn(|| ());

        abandon_start(&ctx, vec![Box::new(first), Box::new(second), Box::new(quiet)]);

        assert!(!ctx.is_running());
        assert!(ctx.monitor.all_task_status().is_empty());
    }
}
