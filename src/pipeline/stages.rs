//! The four derived-asset stages.
//!
//! ```text
//! frames -> FullPointCloud -> ProcessedPointCloud -> RawMesh -> ProcessedMesh
//! ```
//!
//! [`AssetPipeline::ensure_stage`] is idempotent: an asset whose `(step, key)`
//! already exists is returned without invoking any tool. The key of every
//! stage after the first includes its parent asset, so a stage is only
//! reachable once the configured upstream chain exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::crop::{crop_frames, ColorRange};
use super::tools::{ReconstructRequest, ReconstructionTools, SegmentRequest};
use crate::config::PipelineSection;
use crate::error::{with_timeout, RigError, RigResult};
use crate::model::{
    AssetId, AssetKey, AssetMetrics, AssetVariant, ClusteringSetting, ColorSetting,
    DerivedAsset, Frame, FullPointCloudKey, MeshExportSetting, NewAsset, PlatenDimensions,
    PlyExportSetting, PlyGenerationSetting, ProcessedPointCloudKey, RawMeshKey,
    ScalingCorrection, SegmentationSetting, SettingId, SettingTable, Step, StepId, StoredFile, Trial,
};
use crate::store::{require_step, require_trial, resolve_setting, RecordStore};
use crate::transport::{file_name, Transport};

/// A pipeline stage is named by the asset variant it produces.
pub type Stage = AssetVariant;

/// Settings ids parameterizing every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ply_generation: SettingId,
    pub ply_export: SettingId,
    pub crop_color: SettingId,
    pub segmentation: SettingId,
    pub clustering: SettingId,
    pub platen_dimensions: SettingId,
    pub face_color: SettingId,
    pub side_color: SettingId,
    pub mesh_export: SettingId,
    pub scaling_correction: SettingId,
}

impl PipelineConfig {
    /// Cache key of `stage` built on `parent`. `None` when the stage needs a
    /// parent and none was given.
    pub fn key(&self, stage: Stage, parent: Option<AssetId>) -> Option<AssetKey> {
        match stage {
            AssetVariant::FullPointCloud => Some(AssetKey::FullPointCloud(FullPointCloudKey {
                ply_generation: self.ply_generation,
                ply_export: self.ply_export,
                crop_color: self.crop_color,
            })),
            AssetVariant::ProcessedPointCloud => Some(AssetKey::ProcessedPointCloud(
                ProcessedPointCloudKey {
                    full_point_cloud: parent?,
                    segmentation: self.segmentation,
                    clustering: self.clustering,
                    platen_dimensions: self.platen_dimensions,
                    face_color: self.face_color,
                    side_color: self.side_color,
                },
            )),
            AssetVariant::RawMesh => Some(AssetKey::RawMesh(RawMeshKey {
                processed_point_cloud: parent?,
                mesh_export: self.mesh_export,
                scaling_correction: self.scaling_correction,
            })),
            AssetVariant::ProcessedMesh => Some(AssetKey::ProcessedMesh { raw_mesh: parent? }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Ready { asset: DerivedAsset, cache_hit: bool },
    /// A precondition does not hold yet: no frames, or no upstream asset.
    NotReady(String),
    ConfigurationMissing { table: SettingTable, id: i64 },
}

impl StageOutcome {
    pub fn asset(&self) -> Option<&DerivedAsset> {
        match self {
            StageOutcome::Ready { asset, .. } => Some(asset),
            _ => None,
        }
    }
}

/// Where the chain leading to a stage stands.
enum Upstream {
    /// The stage has no parent.
    Root,
    Found(DerivedAsset),
    Missing(AssetVariant),
}

/// Files a tool left in the scratch directory.
struct Produced {
    file: PathBuf,
    aux_file: Option<PathBuf>,
    metrics: AssetMetrics,
}

/// Everything a stage builder needs about its step.
struct StageInput<'a> {
    trial: &'a Trial,
    step: &'a Step,
    frames: &'a [Frame],
    upstream: Option<&'a DerivedAsset>,
    config: &'a PipelineConfig,
    work_dir: &'a Path,
}

pub struct AssetPipeline {
    store: Arc<dyn RecordStore>,
    tools: Arc<dyn ReconstructionTools>,
    transport: Arc<dyn Transport>,
    storage_root: PathBuf,
    scratch_dir: PathBuf,
    tool_timeout: Duration,
    transfer_timeout: Duration,
}

impl AssetPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        tools: Arc<dyn ReconstructionTools>,
        transport: Arc<dyn Transport>,
        section: &PipelineSection,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            store,
            tools,
            transport,
            storage_root: section.storage_root.clone(),
            scratch_dir: section.scratch_dir.clone(),
            tool_timeout: section.tool_timeout(),
            transfer_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<dyn ReconstructionTools> {
        &self.tools
    }

    pub(super) fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub(super) fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// Durable directory of a trial's frames and assets.
    pub fn trial_dir(&self, trial: &Trial) -> PathBuf {
        self.storage_root.join(&trial.name)
    }

    /// Durable path of a stored file belonging to `trial`.
    pub fn stored_path(&self, trial: &Trial, file: &StoredFile) -> PathBuf {
        self.trial_dir(trial).join(file.file_name())
    }

    /// Make sure `stage` exists for `step_id` under `config`.
    pub async fn ensure_stage(
        &self,
        step_id: StepId,
        stage: Stage,
        config: &PipelineConfig,
    ) -> RigResult<StageOutcome> {
        let span = info_span!("stage", step = %step_id, stage = %stage);
        self.ensure_stage_inner(step_id, stage, config)
            .instrument(span)
            .await
    }

    async fn ensure_stage_inner(
        &self,
        step_id: StepId,
        stage: Stage,
        config: &PipelineConfig,
    ) -> RigResult<StageOutcome> {
        let store = self.store.as_ref();
        let step = require_step(store, step_id).await?;
        let frames = store.frames_for_step(step.id).await?;
        if frames.is_empty() {
            return Ok(StageOutcome::NotReady(format!(
                "step {} has no frames",
                step.id
            )));
        }

        let upstream = match self.upstream(step.id, stage, config).await? {
            Upstream::Root => None,
            Upstream::Found(asset) => Some(asset),
            Upstream::Missing(variant) => {
                return Ok(StageOutcome::NotReady(format!(
                    "step {} has no {variant} for this configuration",
                    step.id
                )));
            }
        };
        let key = config
            .key(stage, upstream.as_ref().map(|asset| asset.id))
            .ok_or_else(|| {
                RigError::DataInconsistency(format!("{stage} key built without its parent"))
            })?;

        if let Some(asset) = store.find_asset(step.id, &key).await? {
            debug!(asset = %asset.id, "cache hit");
            return Ok(StageOutcome::Ready {
                asset,
                cache_hit: true,
            });
        }

        let trial = require_trial(store, step.trial_id).await?;
        let work_dir = self.scratch_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work_dir).await?;

        let input = StageInput {
            trial: &trial,
            step: &step,
            frames: &frames,
            upstream: upstream.as_ref(),
            config,
            work_dir: &work_dir,
        };
        let built = self.build(stage, &input).await;
        let result = match built {
            Ok(produced) => self.store_asset(&trial, &step, key, produced).await,
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(dir = %work_dir.display(), "scratch cleanup failed: {e}");
        }

        match result {
            Ok(asset) => {
                info!(asset = %asset.id, volume = ?asset.metrics.volume, "asset stored");
                Ok(StageOutcome::Ready {
                    asset,
                    cache_hit: false,
                })
            }
            Err(RigError::ConfigurationMissing { table, id }) => {
                warn!(%table, id, "settings row missing; stage skipped");
                Ok(StageOutcome::ConfigurationMissing { table, id })
            }
            Err(e) => Err(e),
        }
    }

    /// Walk the configured chain up to (not including) `stage`.
    async fn upstream(
        &self,
        step: StepId,
        stage: Stage,
        config: &PipelineConfig,
    ) -> RigResult<Upstream> {
        let mut parent: Option<DerivedAsset> = None;
        for variant in AssetVariant::ALL {
            if variant == stage {
                break;
            }
            let key = config
                .key(variant, parent.as_ref().map(|asset| asset.id))
                .ok_or_else(|| {
                    RigError::DataInconsistency(format!("{variant} key built without its parent"))
                })?;
            match self.store.find_asset(step, &key).await? {
                Some(asset) => parent = Some(asset),
                None => return Ok(Upstream::Missing(variant)),
            }
        }
        Ok(parent.map_or(Upstream::Root, Upstream::Found))
    }

    async fn build(&self, stage: Stage, input: &StageInput<'_>) -> RigResult<Produced> {
        match stage {
            AssetVariant::FullPointCloud => self.full_point_cloud(input).await,
            AssetVariant::ProcessedPointCloud => self.processed_point_cloud(input).await,
            AssetVariant::RawMesh => self.raw_mesh(input).await,
            AssetVariant::ProcessedMesh => self.processed_mesh(input).await,
        }
    }

    fn parent<'a>(&self, input: &'a StageInput<'_>) -> RigResult<&'a DerivedAsset> {
        input.upstream.ok_or_else(|| {
            RigError::DataInconsistency(format!("step {} has no upstream asset", input.step.id))
        })
    }

    async fn full_point_cloud(&self, input: &StageInput<'_>) -> RigResult<Produced> {
        let store = self.store.as_ref();
        let generation: PlyGenerationSetting =
            resolve_setting(store, input.config.ply_generation).await?;
        let export: PlyExportSetting = resolve_setting(store, input.config.ply_export).await?;
        let color: ColorSetting = resolve_setting(store, input.config.crop_color).await?;

        let frames: Vec<PathBuf> = input
            .frames
            .iter()
            .map(|frame| self.stored_path(input.trial, &frame.file))
            .collect();
        let range = ColorRange::from_setting(&color, generation.crop_stdev_multiplier);
        let cropped = crop_frames(&frames, &input.work_dir.join("cropped"), range).await?;

        let request = ReconstructRequest {
            frames: cropped,
            generation,
            export,
        };
        let tools = self.tools.clone();
        let output = with_timeout("reconstruct", self.tool_timeout, async {
            tools
                .reconstruct(&request, input.work_dir)
                .await
                .map_err(|e| RigError::tool("reconstruct", e))
        })
        .await?;

        Ok(Produced {
            file: output.point_cloud,
            aux_file: Some(output.project),
            metrics: AssetMetrics::default(),
        })
    }

    async fn processed_point_cloud(&self, input: &StageInput<'_>) -> RigResult<Produced> {
        let store = self.store.as_ref();
        let config = input.config;
        let segmentation: SegmentationSetting = resolve_setting(store, config.segmentation).await?;
        let clustering: ClusteringSetting = resolve_setting(store, config.clustering).await?;
        let platen: PlatenDimensions = resolve_setting(store, config.platen_dimensions).await?;
        let face_color: ColorSetting = resolve_setting(store, config.face_color).await?;
        let side_color: ColorSetting = resolve_setting(store, config.side_color).await?;

        let parent = self.parent(input)?;
        let num_platens = if input.trial.subject()?.is_calibration() {
            1
        } else {
            2
        };
        let request = SegmentRequest {
            point_cloud: self.stored_path(input.trial, &parent.file),
            segmentation,
            clustering,
            platen,
            face_color,
            side_color,
            num_platens,
        };
        let tools = self.tools.clone();
        let output = with_timeout("segment", self.tool_timeout, async {
            tools
                .segment(&request, input.work_dir)
                .await
                .map_err(|e| RigError::tool("segment", e))
        })
        .await?;

        Ok(Produced {
            file: output.point_cloud,
            aux_file: None,
            metrics: AssetMetrics {
                scaling_factor: Some(output.scaling_factor),
                volume: None,
            },
        })
    }

    async fn raw_mesh(&self, input: &StageInput<'_>) -> RigResult<Produced> {
        let store = self.store.as_ref();
        let export: MeshExportSetting = resolve_setting(store, input.config.mesh_export).await?;
        let correction: ScalingCorrection =
            resolve_setting(store, input.config.scaling_correction).await?;

        let parent = self.parent(input)?;
        let scale = parent.metrics.scaling_factor.ok_or_else(|| {
            RigError::DataInconsistency(format!(
                "processed point cloud {} has no scaling factor",
                parent.id
            ))
        })?;
        let point_cloud = self.stored_path(input.trial, &parent.file);

        let tools = self.tools.clone();
        let mesh = with_timeout("export_mesh", self.tool_timeout, async {
            tools
                .export_mesh(&point_cloud, &export, input.work_dir)
                .await
                .map_err(|e| RigError::tool("export_mesh", e))
        })
        .await?;

        let combined = scale * correction.factor;
        let volume = self.scaled_volume(&mesh, combined).await?;
        Ok(Produced {
            file: mesh,
            aux_file: None,
            metrics: AssetMetrics {
                scaling_factor: Some(combined),
                volume: Some(volume),
            },
        })
    }

    async fn processed_mesh(&self, input: &StageInput<'_>) -> RigResult<Produced> {
        let parent = self.parent(input)?;
        let combined = parent.metrics.scaling_factor.ok_or_else(|| {
            RigError::DataInconsistency(format!("raw mesh {} has no scaling factor", parent.id))
        })?;
        let raw = self.stored_path(input.trial, &parent.file);

        let tools = self.tools.clone();
        let mesh = with_timeout("repair_mesh", self.tool_timeout, async {
            tools
                .repair_mesh(&raw, input.work_dir)
                .await
                .map_err(|e| RigError::tool("repair_mesh", e))
        })
        .await?;

        let volume = self.scaled_volume(&mesh, combined).await?;
        Ok(Produced {
            file: mesh,
            aux_file: None,
            metrics: AssetMetrics {
                scaling_factor: Some(combined),
                volume: Some(volume),
            },
        })
    }

    /// `|signed volume| × scale`.
    async fn scaled_volume(&self, mesh: &Path, scale: f64) -> RigResult<f64> {
        let signed = self
            .tools
            .mesh_volume(mesh)
            .await
            .map_err(|e| RigError::tool("mesh_volume", e))?;
        if signed < 0.0 {
            debug!(signed, "mesh is inside out");
        }
        Ok(signed.abs() * scale)
    }

    /// Move produced files into the trial directory under fresh names, insert
    /// the asset row and return the row the store now holds for the key.
    async fn store_asset(
        &self,
        trial: &Trial,
        step: &Step,
        key: AssetKey,
        produced: Produced,
    ) -> RigResult<DerivedAsset> {
        let file = rename_unique(&produced.file).await?;
        let aux_file = match &produced.aux_file {
            Some(path) => Some(rename_unique(path).await?),
            None => None,
        };
        let mut paths = vec![file.0.clone()];
        paths.extend(aux_file.iter().map(|(path, _)| path.clone()));
        let names: Vec<String> = paths.iter().filter_map(|p| file_name(p)).collect();

        let dest = self.trial_dir(trial);
        let transport = self.transport.clone();
        with_timeout("asset transfer", self.transfer_timeout, async {
            transport
                .ensure_remote_dir(&dest)
                .await
                .map_err(RigError::transport)?;
            transport
                .send(&paths, &dest, true)
                .await
                .map_err(RigError::transport)
        })
        .await?;
        let missing = self
            .transport
            .verify(&dest, &names)
            .await
            .map_err(RigError::transport)?;
        if !missing.is_empty() {
            return Err(RigError::Transport(format!(
                "{} missing in {} after transfer",
                missing.join(", "),
                dest.display()
            )));
        }

        let new = NewAsset {
            step_id: step.id,
            key,
            file: file.1,
            aux_file: aux_file.map(|(_, stored)| stored),
            metrics: produced.metrics,
        };
        match self.store.insert_asset(new).await {
            Ok(_) => {}
            Err(RigError::UniqueViolation { .. }) => {
                info!(step = %step.id, variant = %key.variant(), "asset stored concurrently; using existing row");
            }
            Err(e) => return Err(e),
        }
        self.store.find_asset(step.id, &key).await?.ok_or_else(|| {
            RigError::DataInconsistency(format!(
                "{} for step {} was stored but cannot be read back",
                key.variant(),
                step.id
            ))
        })
    }
}

/// Rename a produced file to a UUID stem, keeping its extension.
async fn rename_unique(path: &Path) -> RigResult<(PathBuf, StoredFile)> {
    let original = StoredFile::from_path(path).ok_or_else(|| {
        RigError::DataInconsistency(format!("unusable tool output path {}", path.display()))
    })?;
    let stored = StoredFile::new(Uuid::new_v4().to_string(), original.extension);
    let target = path.with_file_name(stored.file_name());
    tokio::fs::rename(path, &target).await?;
    Ok((target, stored))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig {
            ply_generation: SettingId(1),
            ply_export: SettingId(2),
            crop_color: SettingId(3),
            segmentation: SettingId(4),
            clustering: SettingId(5),
            platen_dimensions: SettingId(6),
            face_color: SettingId(7),
            side_color: SettingId(8),
            mesh_export: SettingId(9),
            scaling_correction: SettingId(10),
        }
    }

    #[test]
    fn test_key_requires_parent() {
        let config = config();
        assert!(config.key(AssetVariant::FullPointCloud, None).is_some());
        assert!(config.key(AssetVariant::RawMesh, None).is_none());
        assert_eq!(
            config.key(AssetVariant::ProcessedMesh, Some(AssetId(3))),
            Some(AssetKey::ProcessedMesh {
                raw_mesh: AssetId(3)
            })
        );
    }

    #[test]
    fn test_key_carries_config_ids() {
        let Some(AssetKey::RawMesh(key)) = config().key(AssetVariant::RawMesh, Some(AssetId(8)))
        else {
            panic!("expected a raw mesh key");
        };
        assert_eq!(key.processed_point_cloud, AssetId(8));
        assert_eq!(key.mesh_export, SettingId(9));
        assert_eq!(key.scaling_correction, SettingId(10));
    }

    #[tokio::test]
    async fn test_rename_unique_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.stl");
        tokio::fs::write(&path, b"solid x\nendsolid x\n").await.unwrap();

        let (target, stored) = rename_unique(&path).await.unwrap();
        assert_eq!(stored.extension, "stl");
        assert_ne!(stored.name, "mesh");
        assert!(target.exists());
        assert!(!path.exists());
        assert!(Uuid::parse_str(&stored.name).is_ok());
    }
}
