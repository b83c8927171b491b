mod common;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use edge_ocr::{
    monitor::{ErrorCode, HealthMonitor, Severity, TaskId},
    ocr::{EngineState, InferenceConfig, InferenceEngine, Language, processing::POOL_CAPACITY_BYTES},
};
use frame_ingest::Frame;
use npu_runtime::{Script, SimulatedAccelerator};
use pool_alloc::{MonotonicClock, PoolAllocator, SharedClock};

use common::{HEIGHT, WIDTH, page_at, rig, single_line};

fn page() -> Frame {
    Frame::uniform(WIDTH, HEIGHT, 0xFFFF)
}

#[test]
fn result_below_threshold_is_withheld_and_counted() {
    let mut rig = rig();
    rig.control.lock().unwrap().script = Some(page_at(0.80));

    let forwarded = rig.engine.run_cycle(&page());

    assert!(forwarded.is_none());
    assert_eq!(rig.engine.stats().low_confidence_count, 1);
    assert_eq!(rig.engine.stats().successful_inferences, 1);
    let latest = rig.engine.latest_result().expect("result kept");
    assert!((latest.confidence - 0.80).abs() < 1e-6);
}

#[test]
fn result_above_threshold_is_forwarded() {
    let mut rig = rig();
    let result = rig.engine.run_cycle(&page()).expect("forwarded");
    assert_eq!(result.text, "EXIT GATE 12");
    assert_eq!(result.char_count, 10);
    assert_eq!(result.language, Language::English);
    assert_eq!(rig.engine.stats().low_confidence_count, 0);
}

#[test]
fn over_budget_frame_logs_one_warning_and_stays_usable() {
    let mut rig = rig();
    rig.monitor.register_task(TaskId::Inference).unwrap();
    rig.control.lock().unwrap().detection_us = 9_000;

    let result = rig.engine.process_frame(&page()).unwrap();

    assert!(result.processing_time_us >= 9_000);
    let warnings: Vec<_> = rig
        .monitor
        .error_log()
        .into_iter()
        .filter(|entry| entry.severity == Severity::Warning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].code, ErrorCode::InferenceTimeout);
    assert_ne!(rig.engine.state(), EngineState::Error);
    assert_eq!(rig.engine.stats().deadline_misses, 1);
    assert_eq!(
        rig.monitor.task_status(TaskId::Inference).unwrap().deadline_misses,
        1
    );
}

#[test]
fn low_confidence_fragments_are_discarded() {
    let mut rig = rig();
    rig.control.lock().unwrap().script = Some(single_line("SMUDGE", 0.3));

    let result = rig.engine.process_frame(&page()).unwrap();

    assert!(result.is_empty());
    assert_eq!(rig.engine.stats().failed_inferences, 1);
}

#[test]
fn failed_frames_return_every_pool_block() {
    let mut rig = rig();
    rig.control.lock().unwrap().fail_runs = 3;
    for _ in 0..3 {
        assert!(rig.engine.process_frame(&page()).is_err());
    }
    assert!(rig.engine.process_frame(&page()).is_ok());
    assert_eq!(rig.engine.pool().lock().unwrap().live_blocks(), 0);
    assert_eq!(rig.engine.state(), EngineState::Ready);
}

#[test]
fn mismatched_frame_is_rejected_without_state_change() {
    let mut rig = rig();
    let mut frame = page();
    frame.data.truncate(10);
    assert!(rig.engine.process_frame(&frame).is_err());
    assert_eq!(rig.engine.state(), EngineState::Ready);
}

#[test]
fn pool_stays_available_while_the_accelerator_runs() {
    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let pool = PoolAllocator::shared(POOL_CAPACITY_BYTES, clock.clone()).unwrap();
    let monitor = HealthMonitor::shared(clock.clone());
    let accelerator = SimulatedAccelerator::new(Script::sample_page(), clock.clone())
        .with_latency(Duration::from_millis(250));
    let config = InferenceConfig {
        camera_width: WIDTH,
        camera_height: HEIGHT,
        validation_iterations: 1,
        max_inference_time_us: 10_000_000,
        ..InferenceConfig::default()
    };
    let mut engine = InferenceEngine::new(accelerator, pool.clone(), clock, monitor, config);
    engine.init().unwrap();

    let worker = thread::spawn(move || engine.process_frame(&page()).map(|r| r.text));
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    let live = pool.lock().unwrap().live_blocks();
    let waited = started.elapsed();

    assert!(live > 0, "frame scratch should be allocated mid-run");
    assert!(waited < Duration::from_millis(150), "pool lock waited {waited:?}");
    assert_eq!(worker.join().unwrap().unwrap(), "EXIT GATE 12");
}
