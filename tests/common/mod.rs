//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use compression_rig::acquisition::{StepController, TrialRunner};
use compression_rig::config::{AcquisitionConfig, ControllerConfig, PipelineSection, SimulationConfig};
use compression_rig::hardware::mock::{SimulatedActuator, SimulatedCameras, SimulatedForceSensor};
use compression_rig::hardware::{ForceSensor, RigHardware};
use compression_rig::model::{
    NewFrame, NewStep, NewTrial, NewTrialSubject, SettingId, Step, StoredFile, Trial,
};
use compression_rig::pipeline::{AssetPipeline, MockTools, PipelineConfig};
use compression_rig::store::{seed_defaults, DefaultSettings, MemoryStore, RecordStore};
use compression_rig::transport::{LocalTransport, Transport};

pub const HOME_COUNT: i64 = 7776;
pub const CONTACT_COUNT: i64 = 4797;
pub const REST_SETPOINT: i64 = 5;

/// Transport that reports success but never delivers anything.
pub struct DroppingTransport;

#[async_trait]
impl Transport for DroppingTransport {
    async fn ensure_remote_dir(&self, _dest: &Path) -> Result<()> {
        Ok(())
    }

    async fn send(&self, _files: &[PathBuf], _dest: &Path, _remove_local: bool) -> Result<()> {
        Ok(())
    }

    async fn verify(&self, _dest: &Path, names: &[String]) -> Result<Vec<String>> {
        Ok(names.to_vec())
    }
}

enum ForceModel {
    Constant(f64),
    Spring(f64),
}

pub struct TestRigBuilder {
    actuator: SimulatedActuator,
    force: ForceModel,
    cameras: SimulatedCameras,
    transport: Option<Arc<dyn Transport>>,
    rig: ControllerConfig,
}

impl TestRigBuilder {
    pub fn new() -> Self {
        Self {
            actuator: SimulatedActuator::new(HOME_COUNT, CONTACT_COUNT),
            force: ForceModel::Constant(0.0),
            cameras: SimulatedCameras::new(2, Duration::from_millis(5)),
            transport: None,
            rig: ControllerConfig {
                settle_delay_ms: 10,
                force_samples: 4,
                rest_setpoint: REST_SETPOINT,
                ..ControllerConfig::default()
            },
        }
    }

    pub fn actuator(mut self, actuator: SimulatedActuator) -> Self {
        self.actuator = actuator;
        self
    }

    pub fn constant_force(mut self, value: f64) -> Self {
        self.force = ForceModel::Constant(value);
        self
    }

    /// Force grows by `stiffness` per count of compression past contact.
    pub fn spring_force(mut self, stiffness: f64) -> Self {
        self.force = ForceModel::Spring(stiffness);
        self
    }

    pub fn cameras(mut self, cameras: SimulatedCameras) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn move_timeout_ms(mut self, ms: u64) -> Self {
        self.rig.move_timeout_ms = ms;
        self
    }

    pub async fn build(self) -> TestRig {
        let store = Arc::new(MemoryStore::new());
        let defaults = seed_defaults(store.as_ref()).await.unwrap();
        let actuator = Arc::new(self.actuator);
        let force = Arc::new(match self.force {
            ForceModel::Constant(value) => SimulatedForceSensor::constant(value),
            ForceModel::Spring(stiffness) => SimulatedForceSensor::spring(
                actuator.clone(),
                &SimulationConfig {
                    stiffness_per_count: stiffness,
                    ..SimulationConfig::default()
                },
            ),
        });
        TestRig {
            store,
            actuator,
            force,
            cameras: Arc::new(self.cameras),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(LocalTransport::new())),
            rig: self.rig,
            defaults,
            storage: tempfile::tempdir().unwrap(),
            captures: tempfile::tempdir().unwrap(),
        }
    }
}

/// Simulated rig wired to an in-memory store and temporary directories.
pub struct TestRig {
    pub store: Arc<MemoryStore>,
    pub actuator: Arc<SimulatedActuator>,
    pub force: Arc<SimulatedForceSensor>,
    pub cameras: Arc<SimulatedCameras>,
    pub transport: Arc<dyn Transport>,
    pub rig: ControllerConfig,
    pub defaults: DefaultSettings,
    pub storage: TempDir,
    pub captures: TempDir,
}

impl TestRig {
    pub fn acquisition(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            window_ms: 40,
            capture_dir: self.captures.path().to_path_buf(),
            ..AcquisitionConfig::default()
        }
    }

    pub fn controller(&self) -> StepController {
        let force: Arc<dyn ForceSensor> = self.force.clone();
        let hardware = RigHardware::new(self.actuator.clone(), force, self.cameras.clone());
        StepController::new(
            hardware,
            self.store.clone(),
            self.transport.clone(),
            self.rig.clone(),
            self.acquisition(),
            self.storage.path().to_path_buf(),
            Duration::from_secs(30),
        )
        .with_rng(StdRng::seed_from_u64(7))
    }

    pub fn runner(&self) -> TrialRunner {
        TrialRunner::new(self.controller())
    }

    pub async fn specimen_trial(
        &self,
        name: &str,
        strain_limit: f64,
        strain_delta: f64,
        force_limit: f64,
    ) -> Trial {
        let specimen = self
            .store
            .create_specimen(&format!("{name}-specimen"), "mm")
            .await
            .unwrap();
        self.store
            .create_trial(NewTrial {
                name: name.to_string(),
                strain_limit,
                strain_delta,
                force_limit,
                force_unit: "N".into(),
                subject: NewTrialSubject::Specimen(specimen.id),
                frames_per_step: 5,
            })
            .await
            .unwrap()
    }

    pub async fn fixture_trial(&self, name: &str) -> Trial {
        let fixture = self
            .store
            .create_fixture(&format!("{name}-phantom"), 1520.0, "mm")
            .await
            .unwrap();
        self.store
            .create_trial(NewTrial {
                name: name.to_string(),
                strain_limit: 0.0,
                strain_delta: 0.1,
                force_limit: 1000.0,
                force_unit: "N".into(),
                subject: NewTrialSubject::Fixture(fixture.id),
                frames_per_step: 5,
            })
            .await
            .unwrap()
    }
}

/// Store, directories and mock tools for pipeline tests.
pub struct TestPipeline {
    pub store: Arc<MemoryStore>,
    pub tools: Arc<MockTools>,
    pub defaults: DefaultSettings,
    pub storage: TempDir,
    pub scratch: TempDir,
}

impl TestPipeline {
    pub async fn new(tools: MockTools) -> Self {
        let store = Arc::new(MemoryStore::new());
        let defaults = seed_defaults(store.as_ref()).await.unwrap();
        Self {
            store,
            tools: Arc::new(tools),
            defaults,
            storage: tempfile::tempdir().unwrap(),
            scratch: tempfile::tempdir().unwrap(),
        }
    }

    pub fn pipeline(&self) -> AssetPipeline {
        self.pipeline_on(self.store.clone())
    }

    /// Pipeline over another store, usually one wrapping `self.store`.
    pub fn pipeline_on(&self, store: Arc<dyn RecordStore>) -> AssetPipeline {
        let section = PipelineSection {
            scratch_dir: self.scratch.path().to_path_buf(),
            storage_root: self.storage.path().to_path_buf(),
            tool_timeout_secs: 60,
            ..PipelineSection::default()
        };
        AssetPipeline::new(
            store,
            self.tools.clone(),
            Arc::new(LocalTransport::new()),
            &section,
            Duration::from_secs(30),
        )
    }

    /// Pipeline configuration made of the seeded default rows.
    pub fn config(&self) -> PipelineConfig {
        let d = &self.defaults;
        PipelineConfig {
            ply_generation: d.ply_generation,
            ply_export: d.ply_export,
            crop_color: d.color,
            segmentation: d.segmentation,
            clustering: d.clustering,
            platen_dimensions: d.platen_dimensions,
            face_color: d.color,
            side_color: d.color,
            mesh_export: d.mesh_export,
            scaling_correction: d.scaling_correction,
        }
    }

    pub async fn specimen_trial(&self, name: &str) -> Trial {
        let specimen = self.store.create_specimen(name, "mm").await.unwrap();
        self.store
            .create_trial(NewTrial {
                name: name.to_string(),
                strain_limit: 0.2,
                strain_delta: 0.1,
                force_limit: 1000.0,
                force_unit: "N".into(),
                subject: NewTrialSubject::Specimen(specimen.id),
                frames_per_step: 3,
            })
            .await
            .unwrap()
    }

    pub async fn fixture_trial(&self, name: &str) -> Trial {
        let fixture = self.store.create_fixture(name, 1520.0, "mm").await.unwrap();
        self.store
            .create_trial(NewTrial {
                name: name.to_string(),
                strain_limit: 0.0,
                strain_delta: 0.1,
                force_limit: 1000.0,
                force_unit: "N".into(),
                subject: NewTrialSubject::Fixture(fixture.id),
                frames_per_step: 3,
            })
            .await
            .unwrap()
    }

    /// Insert a step with `frames` photos written into the trial directory.
    pub async fn step_with_frames(&self, trial: &Trial, name: &str, strain: f64, frames: usize) -> Step {
        let step = self
            .store
            .insert_step(NewStep {
                trial_id: trial.id,
                name: name.to_string(),
                strain_target: strain,
            })
            .await
            .unwrap();
        let dir = self.storage.path().join(&trial.name);
        std::fs::create_dir_all(&dir).unwrap();
        let mut rows = Vec::new();
        for i in 0..frames {
            let file = StoredFile::new(format!("{name}-{i:04}"), "png");
            let mut img = RgbImage::from_pixel(16, 12, Rgb([10, 10, 10]));
            img.put_pixel(4, 4, Rgb([200, 30, 30]));
            img.save(dir.join(file.file_name())).unwrap();
            rows.push(NewFrame {
                step_id: step.id,
                camera_setting_id: SettingId(1),
                file,
            });
        }
        if !rows.is_empty() {
            self.store.insert_frames(rows).await.unwrap();
        }
        step
    }
}
