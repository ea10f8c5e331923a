//! Hardware seams of the rig.
//!
//! Drivers report `anyhow::Error`; the step controller folds those into
//! [`crate::error::RigError::Hardware`]. Every call may block for seconds and
//! callers wrap moves in a deadline.
//!
//! Encoder positions are raw counts. See [`crate::units`] for conversions.

pub mod mock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::CameraSetting;

/// Crush-platen stepper with closed-loop encoder feedback.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Drive to the home stop and return the encoder count there.
    async fn home(&self) -> Result<i64>;

    /// Drive until the platen touches the specimen and return that count.
    async fn approach_contact(&self) -> Result<i64>;

    /// Closed-loop move; returns once |position - setpoint| <= tolerance.
    /// A stall is an error.
    async fn move_to(&self, setpoint: i64, tolerance: i64) -> Result<()>;

    async fn read_position(&self) -> Result<i64>;
}

/// Load cell behind an amplifier. The caller averages the samples.
#[async_trait]
pub trait ForceSensor: Send + Sync {
    async fn sample(&self, n: usize) -> Result<Vec<f64>>;
}

/// Address of one connected camera.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CameraPort(pub String);

impl fmt::Display for CameraPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The camera array and its carousel.
#[async_trait]
pub trait CameraSystem: Send + Sync {
    /// Home the carousel and power the cameras. Run once per trial.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Apply a camera setting to every connected camera and return the ports.
    async fn init(&self, setting: &CameraSetting) -> Result<Vec<CameraPort>>;

    /// Capture continuously into `dir` until `stop` is raised, then return
    /// every file written.
    async fn capture_until(
        &self,
        port: &CameraPort,
        dir: &Path,
        stop: Arc<AtomicBool>,
    ) -> Result<Vec<PathBuf>>;

    async fn start_rotation(&self, _hz: f64) -> Result<()> {
        Ok(())
    }

    async fn stop_rotation(&self) -> Result<()> {
        Ok(())
    }
}

/// Devices of one rig, shared by the runner and the step controller.
#[derive(Clone)]
pub struct RigHardware {
    pub actuator: Arc<dyn Actuator>,
    pub force: Arc<dyn ForceSensor>,
    pub cameras: Arc<dyn CameraSystem>,
}

impl RigHardware {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        force: Arc<dyn ForceSensor>,
        cameras: Arc<dyn CameraSystem>,
    ) -> Self {
        Self {
            actuator,
            force,
            cameras,
        }
    }
}
