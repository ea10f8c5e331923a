//! Drive every stage over every step of a trial.

use futures::stream::{self, StreamExt};
use tracing::{error, info, info_span, warn, Instrument};

use super::stages::{AssetPipeline, PipelineConfig, Stage, StageOutcome};
use crate::error::{ErrorKind, RigResult};
use crate::model::{AssetVariant, SettingTable, StepId, TrialId};
use crate::store::require_trial;

/// Why a step's chain stopped short of the last stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageStop {
    NotReady { stage: Stage, reason: String },
    ConfigurationMissing { stage: Stage, table: SettingTable, id: i64 },
    Failed { stage: Stage, kind: ErrorKind, message: String },
}

impl StageStop {
    pub fn stage(&self) -> Stage {
        match self {
            StageStop::NotReady { stage, .. }
            | StageStop::ConfigurationMissing { stage, .. }
            | StageStop::Failed { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepProcessing {
    pub step_id: StepId,
    pub strain_target: f64,
    /// Last stage whose asset is available.
    pub reached: Option<Stage>,
    /// Stages whose asset was built during this run.
    pub built: Vec<Stage>,
    pub stopped: Option<StageStop>,
}

impl StepProcessing {
    pub fn is_complete(&self) -> bool {
        self.reached == Some(AssetVariant::ProcessedMesh)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialProcessingReport {
    pub trial_id: TrialId,
    pub steps: Vec<StepProcessing>,
}

impl TrialProcessingReport {
    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.is_complete()).count()
    }

    pub fn failed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.stopped, Some(StageStop::Failed { .. })))
            .count()
    }
}

/// Run all four stages for each step of a trial, in ascending target strain.
///
/// A step's remaining stages are skipped at its first stop; stage errors are
/// recorded in the report and do not affect other steps. Only errors reading
/// the trial itself are returned.
pub async fn process_trial(
    pipeline: &AssetPipeline,
    trial_id: TrialId,
    config: &PipelineConfig,
) -> RigResult<TrialProcessingReport> {
    let span = info_span!("process_trial", trial = %trial_id);
    process_trial_inner(pipeline, trial_id, config)
        .instrument(span)
        .await
}

async fn process_trial_inner(
    pipeline: &AssetPipeline,
    trial_id: TrialId,
    config: &PipelineConfig,
) -> RigResult<TrialProcessingReport> {
    let store = pipeline.store().as_ref();
    let trial = require_trial(store, trial_id).await?;
    let steps = store.steps_for_trial(trial.id).await?;
    info!(name = %trial.name, steps = steps.len(), "processing trial");

    let mut report = TrialProcessingReport {
        trial_id,
        steps: Vec::with_capacity(steps.len()),
    };
    for step in steps {
        let mut processing = StepProcessing {
            step_id: step.id,
            strain_target: step.strain_target,
            reached: None,
            built: Vec::new(),
            stopped: None,
        };
        for stage in AssetVariant::ALL {
            let stop = match pipeline.ensure_stage(step.id, stage, config).await {
                Ok(StageOutcome::Ready { cache_hit, .. }) => {
                    processing.reached = Some(stage);
                    if !cache_hit {
                        processing.built.push(stage);
                    }
                    continue;
                }
                Ok(StageOutcome::NotReady(reason)) => {
                    warn!(step = %step.id, %stage, %reason, "stage not ready");
                    StageStop::NotReady { stage, reason }
                }
                Ok(StageOutcome::ConfigurationMissing { table, id }) => {
                    StageStop::ConfigurationMissing { stage, table, id }
                }
                Err(e) => {
                    error!(step = %step.id, %stage, kind = %e.kind(), "stage failed: {e}");
                    StageStop::Failed {
                        stage,
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
            };
            processing.stopped = Some(stop);
            break;
        }
        report.steps.push(processing);
    }

    info!(
        completed = report.completed_steps(),
        failed = report.failed_steps(),
        "trial processed"
    );
    Ok(report)
}

/// Process several trials with at most `concurrency` in flight. Results come
/// back in completion order.
pub async fn process_trials(
    pipeline: &AssetPipeline,
    trial_ids: &[TrialId],
    config: &PipelineConfig,
    concurrency: usize,
) -> Vec<(TrialId, RigResult<TrialProcessingReport>)> {
    stream::iter(trial_ids.iter().copied())
        .map(|trial_id| async move { (trial_id, process_trial(pipeline, trial_id, config).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}
