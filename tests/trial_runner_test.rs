//! Trial runner against the simulated rig.

mod common;

use std::sync::Arc;

use common::{DroppingTransport, TestRigBuilder, CONTACT_COUNT, REST_SETPOINT};
use compression_rig::acquisition::{RunOutcome, RunnerState, StepContext, CALIBRATION_STRAIN};
use compression_rig::error::{ErrorKind, RigError};
use compression_rig::hardware::mock::SimulatedActuator;
use compression_rig::model::{SettingId, TrialId};
use compression_rig::store::{MemoryStore, RecordStore};
use compression_rig::units::counts_to_mm;
use tokio_test::{assert_err, assert_ok};
use tracing_test::traced_test;

fn completed(outcome: RunOutcome) -> compression_rig::acquisition::TrialRunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::NotRunnable { reason, .. } => panic!("trial not runnable: {reason}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_step_measures_encoder_strain_and_mean_force() {
    let rig = TestRigBuilder::new().build().await;
    let trial = rig.specimen_trial("gyroid-a", 0.1, 0.1, 1000.0).await;

    // zeroing, the strain-0 step, then the 0.1 step
    rig.force.push_readings(vec![0.0; 4]).await;
    rig.force.push_readings(vec![0.0; 4]).await;
    rig.force.push_readings(vec![12.0, 12.6, 12.0, 12.6]).await;

    let mut runner = rig.runner();
    let report = completed(runner.run(trial.id, rig.defaults.camera).await.unwrap());

    assert_eq!(report.steps.len(), 2);
    let height = report.height_mm.unwrap();
    assert!((height - 17.874).abs() < 1e-9);

    let step = &report.steps[1].step;
    assert!((step.strain_target - 0.1).abs() < 1e-12);
    let strain = step.strain_measured.unwrap();
    assert!((strain - 298.0 / 2979.0).abs() < 1e-12);
    assert!((step.force.unwrap() - 12.3).abs() < 1e-9);

    let specimen_id = rig.store.trial(trial.id).await.unwrap().unwrap().specimen_id.unwrap();
    let specimen = rig.store.specimen(specimen_id).await.unwrap().unwrap();
    assert_eq!(specimen.height_mm, Some(counts_to_mm(2979)));

    assert_eq!(runner.state(), RunnerState::Complete);
    assert_eq!(
        runner.history(),
        &[
            RunnerState::Init,
            RunnerState::Zeroing,
            RunnerState::Stepping(0),
            RunnerState::Stepping(1),
            RunnerState::Complete,
        ]
    );
    assert_eq!(rig.actuator.moves().await, vec![CONTACT_COUNT, 5095, REST_SETPOINT]);
}

#[tokio::test(start_paused = true)]
async fn test_step_count_overshoots_limit() {
    let rig = TestRigBuilder::new().build().await;
    let trial = rig.specimen_trial("gyroid-b", 0.25, 0.1, 1000.0).await;

    let report = completed(rig.runner().run(trial.id, rig.defaults.camera).await.unwrap());

    // ceil(0.25 / 0.1) + 1 steps; the last target passes the limit
    assert_eq!(report.steps.len(), 4);
    let last = report.steps.last().unwrap().step.strain_target;
    assert!(last > 0.25);

    let steps = rig.store.steps_for_trial(trial.id).await.unwrap();
    assert_eq!(steps.len(), 4);
    for step in &steps {
        let frames = rig.store.frames_for_step(step.id).await.unwrap();
        assert!(!frames.is_empty());
        assert!(frames.len() <= 5);
        for frame in &frames {
            assert!(rig.storage.path().join("gyroid-b").join(frame.file.file_name()).exists());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_calibration_runs_one_unmeasured_step() {
    let rig = TestRigBuilder::new().constant_force(2.5).build().await;
    let trial = rig.fixture_trial("phantom-1").await;

    let report = completed(rig.runner().run(trial.id, rig.defaults.camera).await.unwrap());

    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.height_mm, None);
    let step = &report.steps[0].step;
    assert_eq!(step.strain_target, CALIBRATION_STRAIN);
    assert_eq!(step.strain_measured, None);
    assert_eq!(step.force, None);
    assert!(!report.steps[0].frames.is_empty());

    let stored = rig.store.trial(trial.id).await.unwrap().unwrap();
    assert_eq!(stored.force_zero, Some(2.5));
    // no homing or stepping, only the rest move
    assert_eq!(rig.actuator.moves().await, vec![REST_SETPOINT]);
}

#[tokio::test(start_paused = true)]
async fn test_force_limit_stops_after_current_step() {
    let rig = TestRigBuilder::new().spring_force(0.5).build().await;
    let trial = rig.specimen_trial("gyroid-c", 0.5, 0.1, 300.0).await;

    let report = completed(rig.runner().run(trial.id, rig.defaults.camera).await.unwrap());

    // 0, 149, 298, 447 N: the fourth step reaches the limit
    assert!(report.stopped_by_force_limit);
    assert_eq!(report.steps.len(), 4);
    assert!(report.steps[3].force_limit_reached);
    assert!(report.steps[..3].iter().all(|s| !s.force_limit_reached));
    assert_eq!(rig.store.steps_for_trial(trial.id).await.unwrap().len(), 4);
    assert_eq!(rig.actuator.moves().await.last(), Some(&REST_SETPOINT));
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_hardware_stall_fails_trial_and_rests() {
    let rig = TestRigBuilder::new()
        .actuator(SimulatedActuator::new(7776, CONTACT_COUNT).with_stall_beyond(5000))
        .build()
        .await;
    let trial = rig.specimen_trial("gyroid-d", 0.3, 0.1, 1000.0).await;

    let mut runner = rig.runner();
    let err = runner.run(trial.id, rig.defaults.camera).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HardwareFault);
    assert!(err.to_string().contains("stalled"));
    assert_eq!(runner.state(), RunnerState::Failed);
    assert_eq!(rig.actuator.moves().await.last(), Some(&REST_SETPOINT));

    // the failed step row stays, unmeasured and without frames
    let steps = rig.store.steps_for_trial(trial.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].strain_measured, None);
    assert!(rig.store.frames_for_step(steps[1].id).await.unwrap().is_empty());
    assert!(logs_contain("trial failed"));
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn test_force_sensor_failure_mid_trial_fails_and_rests() {
    let rig = TestRigBuilder::new().constant_force(3.0).build().await;
    let trial = rig.specimen_trial("gyroid-i", 0.2, 0.1, 1000.0).await;
    // zeroing and the strain-0 step read the sensor; the 0.1 step does not
    rig.force.fail_after(2);

    let mut runner = rig.runner();
    let err = runner.run(trial.id, rig.defaults.camera).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::HardwareFault);
    assert!(err.to_string().contains("amplifier did not respond"));
    assert_eq!(runner.state(), RunnerState::Failed);
    assert_eq!(rig.actuator.moves().await.last(), Some(&REST_SETPOINT));

    let steps = rig.store.steps_for_trial(trial.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps[0].strain_measured.is_some());
    assert!(!rig.store.frames_for_step(steps[0].id).await.unwrap().is_empty());
    assert_eq!(steps[1].strain_measured, None);
    assert_eq!(steps[1].force, None);
    assert!(rig.store.frames_for_step(steps[1].id).await.unwrap().is_empty());
    assert!(logs_contain("trial failed"));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_move_times_out() {
    let rig = TestRigBuilder::new()
        .actuator(SimulatedActuator::new(7776, CONTACT_COUNT).hanging())
        .move_timeout_ms(2000)
        .build()
        .await;
    let trial = rig.specimen_trial("gyroid-e", 0.1, 0.1, 1000.0).await;

    let err = rig.runner().run(trial.id, rig.defaults.camera).await.unwrap_err();
    assert!(matches!(err, RigError::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_undelivered_photos_leave_step_without_frames() {
    let rig = TestRigBuilder::new()
        .transport(Arc::new(DroppingTransport))
        .build()
        .await;
    let trial = rig.specimen_trial("gyroid-f", 0.1, 0.1, 1000.0).await;

    let mut runner = rig.runner();
    let err = assert_err!(runner.run(trial.id, rig.defaults.camera).await);
    assert_eq!(err.kind(), ErrorKind::TransportFault);
    assert_eq!(runner.state(), RunnerState::Failed);

    let steps = rig.store.steps_for_trial(trial.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert!(rig.store.frames_for_step(steps[0].id).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_step_directly() {
    let rig = TestRigBuilder::new().constant_force(4.0).build().await;
    let trial = rig.specimen_trial("gyroid-g", 0.2, 0.1, 1000.0).await;

    let ctx = StepContext {
        trial_id: trial.id,
        trial_name: trial.name.clone(),
        calibration: false,
        contact_count: CONTACT_COUNT,
        height_mm: counts_to_mm(2979),
        force_zero: 0.0,
        force_limit: 3.0,
        frames_per_step: 2,
        camera_setting_id: rig.defaults.camera,
    };
    let mut controller = rig.controller();
    let report = assert_ok!(controller.run_step(&ctx, 0.2).await);

    assert!(report.force_limit_reached);
    assert_eq!(report.frames.len(), 2);
    assert_eq!(rig.actuator.moves().await, vec![5393]);
    assert_eq!(rig.cameras.last_setting().await, Some(Default::default()));
}

#[tokio::test]
async fn test_missing_trial_is_not_found() {
    let rig = TestRigBuilder::new().build().await;
    let err = rig.runner().run(TrialId(99), SettingId(1)).await.unwrap_err();
    assert!(matches!(err, RigError::NotFound { entity: "trial", id: 99 }));
}

#[tokio::test(start_paused = true)]
async fn test_inconsistent_trial_is_not_runnable() {
    let rig = TestRigBuilder::new().build().await;
    let trial = rig.specimen_trial("gyroid-h", 0.1, 0.1, 1000.0).await;
    let fixture = rig.store.create_fixture("stray", 10.0, "mm").await.unwrap();

    // a snapshot edited by hand so the trial names both subjects
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    rig.store.save(&path).await.unwrap();
    let mut snapshot: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    snapshot["trials"][0]["fixture_id"] = serde_json::json!(fixture.id.0);
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
    let broken = Arc::new(MemoryStore::open(&path).await.unwrap());

    let mut other_rig = TestRigBuilder::new().build().await;
    other_rig.store = broken.clone();
    let outcome = other_rig
        .runner()
        .run(trial.id, rig.defaults.camera)
        .await
        .unwrap();

    match outcome {
        RunOutcome::NotRunnable { trial_id, reason } => {
            assert_eq!(trial_id, trial.id);
            assert!(reason.contains("both"));
        }
        RunOutcome::Completed(_) => panic!("inconsistent trial ran"),
    }
    assert!(broken.steps_for_trial(trial.id).await.unwrap().is_empty());
    assert_eq!(other_rig.actuator.moves().await, vec![REST_SETPOINT]);
}
