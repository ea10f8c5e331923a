//! One strain step: move, measure, photograph, store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::capture::capture_window;
use super::decimate::decimate_files;
use crate::config::{AcquisitionConfig, ControllerConfig};
use crate::error::{with_timeout, RigError, RigResult};
use crate::hardware::RigHardware;
use crate::model::{
    CameraSetting, Frame, NewFrame, NewStep, SettingId, Step, StoredFile, TrialId,
};
use crate::store::{require_step, resolve_setting, RecordStore};
use crate::transport::{file_name, Transport};
use crate::units::{mean, realized_strain, rotation_frequency, strain_setpoint};

/// Per-trial values every step needs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub trial_id: TrialId,
    /// Trial name; the durable directory of the trial's files.
    pub trial_name: String,
    /// Fixture runs neither move nor measure.
    pub calibration: bool,
    /// Encoder count at platen/specimen contact.
    pub contact_count: i64,
    pub height_mm: f64,
    pub force_zero: f64,
    pub force_limit: f64,
    /// Frames kept per step; 0 keeps all.
    pub frames_per_step: u32,
    pub camera_setting_id: SettingId,
}

/// Result of a completed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: Step,
    pub frames: Vec<Frame>,
    /// |force - force_zero| reached the trial's force limit; the runner stops
    /// after this step.
    pub force_limit_reached: bool,
}

/// Executes single strain steps against the rig.
pub struct StepController {
    hardware: RigHardware,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    rig: ControllerConfig,
    acquisition: AcquisitionConfig,
    storage_root: PathBuf,
    transfer_timeout: Duration,
    rng: StdRng,
}

impl StepController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hardware: RigHardware,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        rig: ControllerConfig,
        acquisition: AcquisitionConfig,
        storage_root: PathBuf,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            hardware,
            store,
            transport,
            rig,
            acquisition,
            storage_root,
            transfer_timeout,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed random source for frame decimation.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn hardware(&self) -> &RigHardware {
        &self.hardware
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn rig_config(&self) -> &ControllerConfig {
        &self.rig
    }

    /// Mean of the configured number of force samples.
    pub async fn sample_force(&self) -> RigResult<f64> {
        let samples = self
            .hardware
            .force
            .sample(self.rig.force_samples)
            .await
            .map_err(RigError::hardware)?;
        mean(&samples).ok_or_else(|| RigError::Hardware("force sensor returned no samples".into()))
    }

    /// Run one step to `target_strain`.
    ///
    /// The step row is inserted first and stays in the store whatever happens
    /// afterwards. Frames are only recorded once every photo is verified in
    /// durable storage.
    pub async fn run_step(&mut self, ctx: &StepContext, target_strain: f64) -> RigResult<StepReport> {
        let step = self
            .store
            .insert_step(NewStep {
                trial_id: ctx.trial_id,
                name: Uuid::new_v4().to_string(),
                strain_target: target_strain,
            })
            .await?;

        let span = info_span!("step", trial = %ctx.trial_id, step = %step.id, target = target_strain);
        self.complete_step(ctx, step).instrument(span).await
    }

    async fn complete_step(&mut self, ctx: &StepContext, step: Step) -> RigResult<StepReport> {
        let mut force_limit_reached = false;

        if !ctx.calibration {
            let setpoint = strain_setpoint(ctx.contact_count, ctx.height_mm, step.strain_target);
            self.move_actuator(setpoint).await?;

            tokio::time::sleep(self.rig.settle_delay()).await;

            let position = self
                .hardware
                .actuator
                .read_position()
                .await
                .map_err(RigError::hardware)?;
            let strain = realized_strain(position, ctx.contact_count, ctx.height_mm);
            let force = self.sample_force().await?;
            self.store.record_measurement(step.id, strain, force).await?;
            info!(position, strain, force, "step measured");

            if (force - ctx.force_zero).abs() >= ctx.force_limit {
                warn!(force, limit = ctx.force_limit, "force limit reached");
                force_limit_reached = true;
            }
        }

        let setting: CameraSetting = resolve_setting(self.store.as_ref(), ctx.camera_setting_id).await?;
        let ports = self
            .hardware
            .cameras
            .init(&setting)
            .await
            .map_err(RigError::hardware)?;

        let capture_dir = self.acquisition.capture_dir.join(&step.name);
        let rotation = if self.acquisition.rotate_cameras {
            let hz = rotation_frequency(
                ctx.frames_per_step,
                self.acquisition.seconds_per_photo,
                self.acquisition.steps_per_rotation,
            );
            (hz > 0.0).then_some(hz)
        } else {
            None
        };
        let photos = capture_window(
            self.hardware.cameras.clone(),
            &ports,
            &capture_dir,
            self.acquisition.window(),
            rotation,
        )
        .await
        .map_err(RigError::hardware)?;

        let photos = decimate_files(photos, ctx.frames_per_step as usize, &mut self.rng).await;

        let frames = self.transfer_and_record(ctx, &step, photos).await?;
        if let Err(e) = tokio::fs::remove_dir(&capture_dir).await {
            debug!(dir = %capture_dir.display(), "capture dir left in place: {e}");
        }

        let step = require_step(self.store.as_ref(), step.id).await?;
        info!(frames = frames.len(), "step complete");
        Ok(StepReport {
            step,
            frames,
            force_limit_reached,
        })
    }

    /// Closed-loop move under the configured deadline.
    pub async fn move_actuator(&self, setpoint: i64) -> RigResult<()> {
        let actuator = self.hardware.actuator.clone();
        let tolerance = self.rig.position_tolerance;
        with_timeout(format!("move to {setpoint}"), self.rig.move_timeout(), async move {
            actuator
                .move_to(setpoint, tolerance)
                .await
                .map_err(|e| RigError::hardware(e.context(format!("move to {setpoint}"))))
        })
        .await
    }

    async fn transfer_and_record(
        &self,
        ctx: &StepContext,
        step: &Step,
        photos: Vec<PathBuf>,
    ) -> RigResult<Vec<Frame>> {
        let mut files = Vec::with_capacity(photos.len());
        for path in &photos {
            let file = StoredFile::from_path(path).ok_or_else(|| {
                RigError::DataInconsistency(format!("unusable photo path {}", path.display()))
            })?;
            files.push(file);
        }
        let names: Vec<String> = photos.iter().filter_map(|p| file_name(p)).collect();

        let dest = self.storage_root.join(&ctx.trial_name);
        let transport = self.transport.clone();
        with_timeout("photo transfer", self.transfer_timeout, async {
            transport
                .ensure_remote_dir(&dest)
                .await
                .map_err(RigError::transport)?;
            transport
                .send(&photos, &dest, true)
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
                "{} of {} photos missing in {} after transfer",
                missing.len(),
                names.len(),
                dest.display()
            )));
        }

        let rows = files
            .into_iter()
            .map(|file| NewFrame {
                step_id: step.id,
                camera_setting_id: ctx.camera_setting_id,
                file,
            })
            .collect();
        self.store.insert_frames(rows).await
    }
}
