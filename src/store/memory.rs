//! In-memory record store with an optional JSON snapshot.
//!
//! All tables live behind one `RwLock`, so every trait call is atomic with
//! respect to every other. Ids are allocated per table as `max + 1`.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::RecordStore;
use crate::error::{RigError, RigResult};
use crate::units::{strain_step_count, MAX_STRAIN_STEPS};
use crate::model::{
    AssetId, AssetKey, DerivedAsset, Fixture, FixtureId, Frame, FrameId, NewAsset, NewFrame,
    NewStep, NewTrial, NewTrialSubject, SettingId, SettingTable, Specimen, SpecimenId, Step,
    StepId, Trial, TrialId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingRecord {
    table: SettingTable,
    id: SettingId,
    value: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    trials: Vec<Trial>,
    #[serde(default)]
    specimens: Vec<Specimen>,
    #[serde(default)]
    fixtures: Vec<Fixture>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    frames: Vec<Frame>,
    #[serde(default)]
    assets: Vec<DerivedAsset>,
    #[serde(default)]
    settings: Vec<SettingRecord>,
}

fn next_id<T>(rows: &[T], id: impl Fn(&T) -> i64) -> i64 {
    rows.iter().map(id).max().unwrap_or(0) + 1
}

impl Tables {
    fn step_mut(&mut self, id: StepId) -> RigResult<&mut Step> {
        self.steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(RigError::NotFound {
                entity: "step",
                id: id.0,
            })
    }

    fn has_step(&self, id: StepId) -> bool {
        self.steps.iter().any(|s| s.id == id)
    }
}

/// Record store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot, or start empty when the file does not exist yet.
    pub async fn open(path: &Path) -> RigResult<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let tables: Tables = serde_json::from_slice(&bytes)?;
                debug!(path = %path.display(), trials = tables.trials.len(), "loaded store snapshot");
                Ok(Self {
                    tables: RwLock::new(tables),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the whole store to `path`, replacing the previous snapshot.
    pub async fn save(&self, path: &Path) -> RigResult<()> {
        let bytes = {
            let tables = self.tables.read().await;
            serde_json::to_vec_pretty(&*tables)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "saved store snapshot");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_trial(&self, trial: NewTrial) -> RigResult<Trial> {
        let mut tables = self.tables.write().await;
        if tables.trials.iter().any(|t| t.name == trial.name) {
            return Err(RigError::Store(format!(
                "trial name '{}' already exists",
                trial.name
            )));
        }
        let (specimen_id, fixture_id) = match trial.subject {
            NewTrialSubject::Specimen(id) => {
                if strain_step_count(trial.strain_limit, trial.strain_delta).is_none() {
                    return Err(RigError::InvalidConfiguration(format!(
                        "trial '{}': strain limit {} with delta {} is not a schedule of 1..={MAX_STRAIN_STEPS} steps",
                        trial.name, trial.strain_limit, trial.strain_delta
                    )));
                }
                if !tables.specimens.iter().any(|s| s.id == id) {
                    return Err(RigError::NotFound {
                        entity: "specimen",
                        id: id.0,
                    });
                }
                (Some(id), None)
            }
            NewTrialSubject::Fixture(id) => {
                if !tables.fixtures.iter().any(|f| f.id == id) {
                    return Err(RigError::NotFound {
                        entity: "fixture",
                        id: id.0,
                    });
                }
                (None, Some(id))
            }
        };
        let row = Trial {
            id: TrialId(next_id(&tables.trials, |t| t.id.0)),
            name: trial.name,
            strain_limit: trial.strain_limit,
            strain_delta: trial.strain_delta,
            force_limit: trial.force_limit,
            force_unit: trial.force_unit,
            force_zero: None,
            specimen_id,
            fixture_id,
            frames_per_step: trial.frames_per_step,
            created_at: Utc::now(),
        };
        tables.trials.push(row.clone());
        Ok(row)
    }

    async fn trial(&self, id: TrialId) -> RigResult<Option<Trial>> {
        let tables = self.tables.read().await;
        Ok(tables.trials.iter().find(|t| t.id == id).cloned())
    }

    async fn set_force_zero(&self, id: TrialId, force_zero: f64) -> RigResult<()> {
        let mut tables = self.tables.write().await;
        let trial = tables
            .trials
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(RigError::NotFound {
                entity: "trial",
                id: id.0,
            })?;
        trial.force_zero = Some(force_zero);
        Ok(())
    }

    async fn create_specimen(&self, name: &str, geometry_units: &str) -> RigResult<Specimen> {
        let mut tables = self.tables.write().await;
        let row = Specimen {
            id: SpecimenId(next_id(&tables.specimens, |s| s.id.0)),
            name: name.to_string(),
            geometry_units: geometry_units.to_string(),
            height_mm: None,
        };
        tables.specimens.push(row.clone());
        Ok(row)
    }

    async fn specimen(&self, id: SpecimenId) -> RigResult<Option<Specimen>> {
        let tables = self.tables.read().await;
        Ok(tables.specimens.iter().find(|s| s.id == id).cloned())
    }

    async fn set_specimen_height(&self, id: SpecimenId, height_mm: f64) -> RigResult<()> {
        let mut tables = self.tables.write().await;
        let specimen = tables
            .specimens
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(RigError::NotFound {
                entity: "specimen",
                id: id.0,
            })?;
        specimen.height_mm = Some(height_mm);
        Ok(())
    }

    async fn create_fixture(
        &self,
        name: &str,
        volume: f64,
        geometry_units: &str,
    ) -> RigResult<Fixture> {
        let mut tables = self.tables.write().await;
        let row = Fixture {
            id: FixtureId(next_id(&tables.fixtures, |f| f.id.0)),
            name: name.to_string(),
            volume,
            geometry_units: geometry_units.to_string(),
        };
        tables.fixtures.push(row.clone());
        Ok(row)
    }

    async fn fixture(&self, id: FixtureId) -> RigResult<Option<Fixture>> {
        let tables = self.tables.read().await;
        Ok(tables.fixtures.iter().find(|f| f.id == id).cloned())
    }

    async fn insert_step(&self, step: NewStep) -> RigResult<Step> {
        let mut tables = self.tables.write().await;
        if !tables.trials.iter().any(|t| t.id == step.trial_id) {
            return Err(RigError::NotFound {
                entity: "trial",
                id: step.trial_id.0,
            });
        }
        if tables.steps.iter().any(|s| s.name == step.name) {
            return Err(RigError::Store(format!(
                "step name '{}' already exists",
                step.name
            )));
        }
        let row = Step {
            id: StepId(next_id(&tables.steps, |s| s.id.0)),
            trial_id: step.trial_id,
            name: step.name,
            strain_target: step.strain_target,
            strain_measured: None,
            force: None,
            created_at: Utc::now(),
        };
        tables.steps.push(row.clone());
        Ok(row)
    }

    async fn step(&self, id: StepId) -> RigResult<Option<Step>> {
        let tables = self.tables.read().await;
        Ok(tables.steps.iter().find(|s| s.id == id).cloned())
    }

    async fn steps_for_trial(&self, trial: TrialId) -> RigResult<Vec<Step>> {
        let tables = self.tables.read().await;
        let mut steps: Vec<Step> = tables
            .steps
            .iter()
            .filter(|s| s.trial_id == trial)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.strain_target
                .total_cmp(&b.strain_target)
                .then(a.id.cmp(&b.id))
        });
        Ok(steps)
    }

    async fn record_measurement(&self, step: StepId, strain: f64, force: f64) -> RigResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables.step_mut(step)?;
        if row.strain_measured.is_some() || row.force.is_some() {
            return Err(RigError::DataInconsistency(format!(
                "step {step} already has a measurement"
            )));
        }
        row.strain_measured = Some(strain);
        row.force = Some(force);
        Ok(())
    }

    async fn insert_frames(&self, frames: Vec<NewFrame>) -> RigResult<Vec<Frame>> {
        let mut tables = self.tables.write().await;
        if let Some(orphan) = frames.iter().find(|f| !tables.has_step(f.step_id)) {
            return Err(RigError::NotFound {
                entity: "step",
                id: orphan.step_id.0,
            });
        }
        let mut id = next_id(&tables.frames, |f| f.id.0);
        let mut inserted = Vec::with_capacity(frames.len());
        for frame in frames {
            let row = Frame {
                id: FrameId(id),
                step_id: frame.step_id,
                camera_setting_id: frame.camera_setting_id,
                file: frame.file,
            };
            id += 1;
            inserted.push(row);
        }
        tables.frames.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn frames_for_step(&self, step: StepId) -> RigResult<Vec<Frame>> {
        let tables = self.tables.read().await;
        Ok(tables
            .frames
            .iter()
            .filter(|f| f.step_id == step)
            .cloned()
            .collect())
    }

    async fn find_asset(&self, step: StepId, key: &AssetKey) -> RigResult<Option<DerivedAsset>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assets
            .iter()
            .find(|a| a.step_id == step && a.key == *key)
            .cloned())
    }

    async fn insert_asset(&self, asset: NewAsset) -> RigResult<DerivedAsset> {
        let mut tables = self.tables.write().await;
        if !tables.has_step(asset.step_id) {
            return Err(RigError::NotFound {
                entity: "step",
                id: asset.step_id.0,
            });
        }
        if let Some(parent) = asset.key.parent() {
            let expected = asset.key.variant().upstream();
            let parent_ok = tables
                .assets
                .iter()
                .any(|a| a.id == parent && Some(a.variant()) == expected);
            if !parent_ok {
                return Err(RigError::NotFound {
                    entity: "parent asset",
                    id: parent.0,
                });
            }
        }
        if tables
            .assets
            .iter()
            .any(|a| a.step_id == asset.step_id && a.key == asset.key)
        {
            return Err(RigError::UniqueViolation {
                step_id: asset.step_id,
                variant: asset.key.variant(),
            });
        }
        let row = DerivedAsset {
            id: AssetId(next_id(&tables.assets, |a| a.id.0)),
            step_id: asset.step_id,
            key: asset.key,
            file: asset.file,
            aux_file: asset.aux_file,
            metrics: asset.metrics,
            created_at: Utc::now(),
        };
        tables.assets.push(row.clone());
        Ok(row)
    }

    async fn assets_for_step(&self, step: StepId) -> RigResult<Vec<DerivedAsset>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assets
            .iter()
            .filter(|a| a.step_id == step)
            .cloned()
            .collect())
    }

    async fn fetch_setting(
        &self,
        table: SettingTable,
        id: SettingId,
    ) -> RigResult<Option<serde_json::Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .settings
            .iter()
            .find(|s| s.table == table && s.id == id)
            .map(|s| s.value.clone()))
    }

    async fn upsert_setting(
        &self,
        table: SettingTable,
        value: serde_json::Value,
    ) -> RigResult<SettingId> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .settings
            .iter()
            .find(|s| s.table == table && s.value == value)
        {
            return Ok(existing.id);
        }
        let id = SettingId(
            tables
                .settings
                .iter()
                .filter(|s| s.table == table)
                .map(|s| s.id.0)
                .max()
                .unwrap_or(0)
                + 1,
        );
        tables.settings.push(SettingRecord { table, id, value });
        Ok(id)
    }
}
