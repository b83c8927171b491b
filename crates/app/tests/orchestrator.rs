mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use edge_ocr::{
    monitor::SystemState,
    ocr::{InferenceConfig, PipelineConfig, PipelineContext, Stages, TelemetryOptions, supervise},
};
use pool_alloc::{MonotonicClock, SharedClock};

use common::{HEIGHT, ProbeSolenoid, Thermometer, WIDTH};

fn config(frames: u64) -> PipelineConfig {
    PipelineConfig {
        inference: InferenceConfig {
            camera_width: WIDTH,
            camera_height: HEIGHT,
            validation_iterations: 2,
            ..InferenceConfig::default()
        },
        accelerator_latency: Duration::ZERO,
        capture_period: Duration::from_millis(5),
        run_for: Some(Duration::from_secs(10)),
        frame_limit: Some(frames),
        max_restarts: 1,
        realtime_actuation: false,
        telemetry: TelemetryOptions::default(),
    }
}

fn context() -> PipelineContext {
    let clock: SharedClock = Arc::new(MonotonicClock::new());
    PipelineContext::new(clock).unwrap()
}

#[test]
fn frame_limited_run_ends_gracefully_with_every_result_delivered() {
    let config = config(5);
    let ctx = context();

    let report = supervise(&config, &ctx, Stages::simulated).unwrap();

    assert_eq!(report.attempts, 1);
    assert!(report.restart_reasons.is_empty());
    assert_eq!(report.frames_captured, 5);
    assert!(report.frames_processed >= 1 && report.frames_processed <= 5);
    assert_eq!(report.results_forwarded, report.frames_processed);
    assert_eq!(report.utterances, report.results_forwarded);
    assert_eq!(report.messages_tapped, report.results_forwarded);
    assert!(!report.emergency_shutdown);
    assert_eq!(ctx.pool.lock().unwrap().live_blocks(), 0);
    assert!(ctx.monitor.all_task_status().is_empty());
}

#[test]
fn overheating_stops_the_pipeline_and_outputs() {
    let mut config = config(1_000);
    config.frame_limit = None;
    let ctx = context();
    let solenoid = ProbeSolenoid::default();
    let probe = solenoid.clone();

    let report = supervise(&config, &ctx, |config, clock| {
        let mut stages = Stages::simulated(config, clock)?;
        stages.sensors = Box::new(Thermometer::at(92.0));
        stages.tactile = Box::new(probe.clone());
        Ok(stages)
    })
    .unwrap();

    assert!(report.emergency_shutdown);
    assert_eq!(report.attempts, 1);
    assert!(ctx.monitor.shutdown_requested());
    assert!(solenoid.stopped.load(Ordering::SeqCst));
    assert_eq!(ctx.monitor.system_state(), SystemState::Shutdown);
}

#[test]
fn repeated_start_failures_exhaust_the_restart_budget() {
    let config = config(1);
    let ctx = context();
    let builds = AtomicU32::new(0);

    let outcome = supervise(&config, &ctx, |_, _| {
        builds.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("camera missing")
    });

    assert!(outcome.is_err());
    assert_eq!(builds.load(Ordering::SeqCst), config.max_restarts + 1);
}
