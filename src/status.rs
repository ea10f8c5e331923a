//! Progress of trials through acquisition and processing.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::RigResult;
use crate::model::{AssetVariant, TrialId};
use crate::store::{require_trial, RecordStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialStatus {
    pub trial_id: TrialId,
    pub name: String,
    pub steps_required: usize,
    pub steps_recorded: usize,
    pub steps_with_frames: usize,
    /// Steps holding at least one asset of each variant.
    pub steps_with_asset: BTreeMap<AssetVariant, usize>,
}

impl TrialStatus {
    pub fn steps_with(&self, variant: AssetVariant) -> usize {
        self.steps_with_asset.get(&variant).copied().unwrap_or(0)
    }
}

/// Status of each trial, in the order given.
pub async fn trial_status(
    store: &dyn RecordStore,
    trial_ids: &[TrialId],
) -> RigResult<Vec<TrialStatus>> {
    let mut out = Vec::with_capacity(trial_ids.len());
    for &trial_id in trial_ids {
        let trial = require_trial(store, trial_id).await?;
        let steps_required = match trial.subject() {
            Ok(subject) if subject.is_calibration() => 1,
            _ => trial.steps_required(),
        };

        let steps = store.steps_for_trial(trial.id).await?;
        let mut steps_with_frames = 0;
        let mut steps_with_asset: BTreeMap<AssetVariant, usize> =
            AssetVariant::ALL.iter().map(|&variant| (variant, 0)).collect();
        for step in &steps {
            if !store.frames_for_step(step.id).await?.is_empty() {
                steps_with_frames += 1;
            }
            let assets = store.assets_for_step(step.id).await?;
            for variant in AssetVariant::ALL {
                if assets.iter().any(|asset| asset.variant() == variant) {
                    *steps_with_asset.entry(variant).or_default() += 1;
                }
            }
        }

        out.push(TrialStatus {
            trial_id,
            name: trial.name,
            steps_required,
            steps_recorded: steps.len(),
            steps_with_frames,
            steps_with_asset,
        });
    }
    Ok(out)
}

/// Fixed-width table, one row per trial.
pub fn render_table(statuses: &[TrialStatus]) -> String {
    let mut out = format!(
        "{:>5}  {:<24} {:>8} {:>8} {:>7} {:>6} {:>6} {:>6} {:>6}\n",
        "id", "name", "required", "recorded", "frames", "full", "proc", "raw", "mesh"
    );
    for status in statuses {
        let _ = writeln!(
            out,
            "{:>5}  {:<24} {:>8} {:>8} {:>7} {:>6} {:>6} {:>6} {:>6}",
            status.trial_id,
            status.name,
            status.steps_required,
            status.steps_recorded,
            status.steps_with_frames,
            status.steps_with(AssetVariant::FullPointCloud),
            status.steps_with(AssetVariant::ProcessedPointCloud),
            status.steps_with(AssetVariant::RawMesh),
            status.steps_with(AssetVariant::ProcessedMesh),
        );
    }
    out
}
