//! Platen colour calibration from a reconstructed point cloud.

use tracing::{info, warn};
use uuid::Uuid;

use super::stages::{AssetPipeline, PipelineConfig};
use crate::error::{with_timeout, RigError, RigResult};
use crate::model::{AssetVariant, ColorSetting, SegmentationSetting, SettingId, StepId};
use crate::store::{require_step, require_trial, resolve_setting, upsert_setting_row};

/// Measure the colours of the largest planes in a step's full point cloud and
/// store each as a colour setting. Returns the setting ids, largest plane
/// first, for use as face and side colours.
pub async fn determine_plane_colors(
    pipeline: &AssetPipeline,
    step_id: StepId,
    config: &PipelineConfig,
    plane_limit: u32,
) -> RigResult<Vec<SettingId>> {
    let store = pipeline.store().as_ref();
    let step = require_step(store, step_id).await?;
    let key = config
        .key(AssetVariant::FullPointCloud, None)
        .ok_or_else(|| RigError::DataInconsistency("full point cloud key unavailable".into()))?;
    let cloud = store.find_asset(step.id, &key).await?.ok_or_else(|| {
        RigError::DataInconsistency(format!(
            "step {} has no full point cloud for this configuration",
            step.id
        ))
    })?;
    let segmentation: SegmentationSetting = resolve_setting(store, config.segmentation).await?;
    let trial = require_trial(store, step.trial_id).await?;
    let point_cloud = pipeline.stored_path(&trial, &cloud.file);

    let work_dir = pipeline.scratch_dir().join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&work_dir).await?;
    let tools = pipeline.tools().clone();
    let planes: RigResult<Vec<ColorSetting>> =
        with_timeout("plane_colors", pipeline.tool_timeout(), async {
            tools
                .plane_colors(&point_cloud, &segmentation, plane_limit, &work_dir)
                .await
                .map_err(|e| RigError::tool("plane_colors", e))
        })
        .await;
    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        warn!(dir = %work_dir.display(), "scratch cleanup failed: {e}");
    }

    let mut ids = Vec::new();
    for plane in planes? {
        ids.push(upsert_setting_row(store, &plane).await?);
    }
    info!(step = %step.id, planes = ids.len(), "plane colours stored");
    Ok(ids)
}
