//! Trial runner state machine.
//!
//! ```text
//! Init -> Zeroing -> Stepping(0) -> Stepping(1) -> ... -> Complete
//!                \________________________________________-> Failed
//! ```
//!
//! The actuator is always sent back to the rest setpoint when the runner
//! leaves, whether the trial completed, failed or was not runnable.

use tracing::{error, info, warn};

use super::step::{StepContext, StepController, StepReport};
use crate::error::{RigError, RigResult};
use crate::model::{SettingId, Trial, TrialId, TrialSubject};
use crate::store::require_trial;
use crate::units::{counts_to_mm, strain_schedule, MAX_STRAIN_STEPS};

/// Nominal strain recorded for the single step of a calibration run.
pub const CALIBRATION_STRAIN: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Zeroing,
    Stepping(usize),
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TrialRunReport {
    pub trial_id: TrialId,
    pub force_zero: f64,
    /// Encoder-measured specimen height; `None` for calibration runs.
    pub height_mm: Option<f64>,
    pub steps: Vec<StepReport>,
    pub stopped_by_force_limit: bool,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(TrialRunReport),
    /// The trial row cannot be run as stored; nothing was recorded.
    NotRunnable { trial_id: TrialId, reason: String },
}

pub struct TrialRunner {
    controller: StepController,
    state: RunnerState,
    history: Vec<RunnerState>,
}

impl TrialRunner {
    pub fn new(controller: StepController) -> Self {
        Self {
            controller,
            state: RunnerState::Init,
            history: vec![RunnerState::Init],
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Every state entered, in order.
    pub fn history(&self) -> &[RunnerState] {
        &self.history
    }

    fn enter(&mut self, state: RunnerState) {
        info!(from = ?self.state, to = ?state, "runner state");
        self.state = state;
        self.history.push(state);
    }

    /// Run a trial from zero strain to its limit.
    pub async fn run(&mut self, trial_id: TrialId, camera_setting_id: SettingId) -> RigResult<RunOutcome> {
        self.state = RunnerState::Init;
        self.history = vec![RunnerState::Init];

        let trial = require_trial(self.controller.store().as_ref(), trial_id).await?;

        let subject = match self.runnable_subject(&trial).await {
            Ok(subject) => subject,
            Err(RigError::DataInconsistency(reason)) => {
                warn!(trial = %trial_id, %reason, "trial not runnable");
                self.rest_best_effort().await;
                return Ok(RunOutcome::NotRunnable { trial_id, reason });
            }
            Err(e) => return Err(e),
        };

        match self.execute(&trial, subject, camera_setting_id).await {
            Ok(report) => {
                if let Err(e) = self.rest().await {
                    self.enter(RunnerState::Failed);
                    return Err(e);
                }
                self.enter(RunnerState::Complete);
                info!(trial = %trial_id, steps = report.steps.len(), "trial complete");
                Ok(RunOutcome::Completed(report))
            }
            Err(e) => {
                error!(trial = %trial_id, kind = %e.kind(), "trial failed: {e}");
                self.enter(RunnerState::Failed);
                self.rest_best_effort().await;
                Err(e)
            }
        }
    }

    async fn runnable_subject(&self, trial: &Trial) -> RigResult<TrialSubject> {
        let subject = trial.subject()?;
        let store = self.controller.store();
        match subject {
            TrialSubject::Specimen(id) => {
                if store.specimen(id).await?.is_none() {
                    return Err(RigError::DataInconsistency(format!(
                        "trial {} references missing specimen {id}",
                        trial.id
                    )));
                }
            }
            TrialSubject::Fixture(id) => {
                if store.fixture(id).await?.is_none() {
                    return Err(RigError::DataInconsistency(format!(
                        "trial {} references missing fixture {id}",
                        trial.id
                    )));
                }
            }
        }
        Ok(subject)
    }

    async fn execute(
        &mut self,
        trial: &Trial,
        subject: TrialSubject,
        camera_setting_id: SettingId,
    ) -> RigResult<TrialRunReport> {
        let schedule = match subject {
            TrialSubject::Specimen(_) => {
                let schedule = strain_schedule(trial.strain_limit, trial.strain_delta);
                if schedule.is_empty() {
                    return Err(RigError::InvalidConfiguration(format!(
                        "trial {} has strain limit {} and delta {}; delta must be > 0, the limit finite and the schedule at most {} steps",
                        trial.id, trial.strain_limit, trial.strain_delta, MAX_STRAIN_STEPS
                    )));
                }
                schedule
            }
            TrialSubject::Fixture(_) => vec![CALIBRATION_STRAIN],
        };

        self.enter(RunnerState::Zeroing);
        let store = self.controller.store().clone();
        let force_zero = self.controller.sample_force().await?;
        store.set_force_zero(trial.id, force_zero).await?;
        info!(force_zero, "force zeroed");

        let (contact_count, height_mm) = match subject {
            TrialSubject::Specimen(specimen) => {
                let actuator = self.controller.hardware().actuator.clone();
                let zero = actuator.home().await.map_err(RigError::hardware)?;
                let contact = actuator
                    .approach_contact()
                    .await
                    .map_err(RigError::hardware)?;
                let height = counts_to_mm((zero - contact).abs());
                if height <= 0.0 {
                    return Err(RigError::Hardware(format!(
                        "contact reached at the home count {zero}; no specimen height"
                    )));
                }
                store.set_specimen_height(specimen, height).await?;
                info!(zero, contact, height_mm = height, "specimen height measured");
                (contact, Some(height))
            }
            TrialSubject::Fixture(_) => (0, None),
        };

        self.controller
            .hardware()
            .cameras
            .setup()
            .await
            .map_err(RigError::hardware)?;

        let ctx = StepContext {
            trial_id: trial.id,
            trial_name: trial.name.clone(),
            calibration: subject.is_calibration(),
            contact_count,
            height_mm: height_mm.unwrap_or(1.0),
            force_zero,
            force_limit: trial.force_limit,
            frames_per_step: trial.frames_per_step,
            camera_setting_id,
        };

        let mut steps = Vec::with_capacity(schedule.len());
        let mut stopped_by_force_limit = false;
        for (n, target) in schedule.into_iter().enumerate() {
            self.enter(RunnerState::Stepping(n));
            let report = self.controller.run_step(&ctx, target).await?;
            let limit_hit = report.force_limit_reached;
            steps.push(report);
            if limit_hit {
                stopped_by_force_limit = true;
                break;
            }
        }

        Ok(TrialRunReport {
            trial_id: trial.id,
            force_zero,
            height_mm,
            steps,
            stopped_by_force_limit,
        })
    }

    async fn rest(&self) -> RigResult<()> {
        self.controller
            .move_actuator(self.controller.rig_config().rest_setpoint)
            .await
    }

    async fn rest_best_effort(&self) {
        if let Err(e) = self.rest().await {
            error!("rest move failed: {e}");
        }
    }
}
