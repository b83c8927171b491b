mod common;

use edge_ocr::{
    monitor::{
        ErrorCode, RECOVERY_COOLDOWN_MS, RecoveryAction, Severity, SystemState, TaskId,
    },
    ocr::EngineState,
};
use frame_ingest::Frame;

use common::{HEIGHT, WIDTH, rig};

fn page() -> Frame {
    Frame::uniform(WIDTH, HEIGHT, 0xFFFF)
}

#[test]
fn six_consecutive_errors_trigger_exactly_one_recovery() {
    let mut rig = rig();
    rig.monitor.register_task(TaskId::Inference).unwrap();
    rig.control.lock().unwrap().fail_runs = u32::MAX;

    for _ in 0..5 {
        assert!(rig.engine.run_cycle(&page()).is_none());
    }
    let before = rig.monitor.recovery_record(TaskId::Inference).unwrap();
    assert_eq!(before.attempts, 0);
    assert_eq!(before.consecutive_errors, 5);

    rig.engine.run_cycle(&page());

    let after = rig.monitor.recovery_record(TaskId::Inference).unwrap();
    assert_eq!(after.attempts, 1);
    assert_eq!(after.successes, 1);
    assert_eq!(after.last_level, RecoveryAction::TaskRestart);
    assert_eq!(after.next_level, RecoveryAction::TaskRestart);
    assert_eq!(after.consecutive_errors, 0);
    assert_eq!(rig.engine.state(), EngineState::Ready);
}

#[test]
fn successes_in_between_keep_recovery_away() {
    let mut rig = rig();
    for _ in 0..4 {
        rig.control.lock().unwrap().fail_runs = 5;
        for _ in 0..5 {
            rig.engine.run_cycle(&page());
        }
        assert!(rig.engine.run_cycle(&page()).is_some());
    }
    let record = rig.monitor.recovery_record(TaskId::Inference).unwrap();
    assert_eq!(record.attempts, 0);
    assert_eq!(record.consecutive_errors, 0);
}

#[test]
fn failed_self_test_resets_count_and_escalates() {
    let mut rig = rig();
    rig.control.lock().unwrap().fail_runs = u32::MAX;
    for _ in 0..6 {
        rig.engine.run_cycle(&page());
    }
    assert_eq!(
        rig.monitor.recovery_record(TaskId::Inference).unwrap().attempts,
        1
    );

    rig.clock.advance_ms(RECOVERY_COOLDOWN_MS + 1);
    rig.control.lock().unwrap().models_missing = true;
    for _ in 0..6 {
        rig.engine.run_cycle(&page());
    }

    let record = rig.monitor.recovery_record(TaskId::Inference).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.failures, 1);
    assert_eq!(record.consecutive_errors, 0);
    assert_eq!(record.last_level, RecoveryAction::TaskRestart);
    assert_eq!(record.next_level, RecoveryAction::SubsystemReset);
    assert_eq!(rig.engine.state(), EngineState::Error);
    assert!(
        rig.monitor
            .error_log()
            .iter()
            .any(|entry| entry.code == ErrorCode::RecoveryFailed
                && entry.severity == Severity::Critical)
    );
}

#[test]
fn same_level_inside_cooldown_escalates_instead() {
    let mut rig = rig();
    rig.control.lock().unwrap().fail_runs = u32::MAX;
    for _ in 0..12 {
        rig.engine.run_cycle(&page());
    }
    let record = rig.monitor.recovery_record(TaskId::Inference).unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.last_level, RecoveryAction::SubsystemReset);
}

#[test]
fn emergency_shutdown_is_queued_for_registered_tasks() {
    let rig = rig();
    for task in [TaskId::Inference, TaskId::Synthesis] {
        rig.monitor.register_task(task).unwrap();
    }
    rig.monitor.transition(SystemState::Normal).unwrap();

    let state = rig.monitor.record_sample(edge_ocr::monitor::ResourceSample {
        temperature_c: 90.0,
        ..Default::default()
    });

    assert_eq!(state, SystemState::Emergency);
    assert!(rig.monitor.shutdown_requested());
    assert_eq!(
        rig.monitor.take_pending_action(TaskId::Synthesis),
        Some(RecoveryAction::EmergencyShutdown)
    );
    assert_eq!(rig.monitor.take_pending_action(TaskId::Synthesis), None);
}
