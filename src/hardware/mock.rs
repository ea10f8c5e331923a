//! Simulated Hardware
//!
//! Stand-ins for the crush actuator, the load cell and the camera array, used
//! by `simulate-trial` and by the tests. All waiting goes through
//! `tokio::time`, so paused-clock tests run instantly.
//!
//! # Available Simulations
//!
//! - `SimulatedActuator` - encoder-backed stepper with optional stall or hang
//! - `SimulatedForceSensor` - scripted readings or a linear spring model
//! - `SimulatedCameras` - writes small PNG frames at a fixed interval per port

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{Actuator, CameraPort, CameraSystem, ForceSensor};
use crate::config::SimulationConfig;
use crate::model::CameraSetting;

// =============================================================================
// SimulatedActuator
// =============================================================================

#[derive(Debug)]
struct ActuatorState {
    position: i64,
    /// Platen is resting on the specimen
    loaded: bool,
    moves: Vec<i64>,
}

/// Simulated crush stepper.
///
/// Travels at a fixed count rate. A move may be configured to stall beyond a
/// setpoint or to never settle, which exercises the controller's fault and
/// timeout paths.
pub struct SimulatedActuator {
    state: Arc<RwLock<ActuatorState>>,
    home_count: i64,
    contact_count: i64,
    counts_per_sec: f64,
    /// Offset of the settled position from the setpoint, clamped to tolerance
    settle_offset: i64,
    stall_beyond: Option<i64>,
    hang: bool,
}

impl SimulatedActuator {
    /// Actuator parked at `home_count` that meets the specimen at `contact_count`.
    pub fn new(home_count: i64, contact_count: i64) -> Self {
        Self {
            state: Arc::new(RwLock::new(ActuatorState {
                position: home_count,
                loaded: false,
                moves: Vec::new(),
            })),
            home_count,
            contact_count,
            counts_per_sec: 2000.0,
            settle_offset: 0,
            stall_beyond: None,
            hang: false,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.home_count, config.contact_count)
    }

    /// Settle at `setpoint + offset` (limited by the move tolerance).
    pub fn with_settle_offset(mut self, offset: i64) -> Self {
        self.settle_offset = offset;
        self
    }

    /// Fail any move whose setpoint exceeds `count`.
    pub fn with_stall_beyond(mut self, count: i64) -> Self {
        self.stall_beyond = Some(count);
        self
    }

    /// Never report a settled move.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Setpoints commanded so far, in order.
    pub async fn moves(&self) -> Vec<i64> {
        self.state.read().await.moves.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.read().await.loaded
    }

    pub fn contact_count(&self) -> i64 {
        self.contact_count
    }

    async fn travel(&self, target: i64) {
        let current = self.state.read().await.position;
        let delay_ms = ((target - current).abs() as f64 / self.counts_per_sec * 1000.0) as u64;
        sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn home(&self) -> Result<i64> {
        self.travel(self.home_count).await;
        let mut state = self.state.write().await;
        state.position = self.home_count;
        state.loaded = false;
        debug!(count = self.home_count, "simulated actuator homed");
        Ok(self.home_count)
    }

    async fn approach_contact(&self) -> Result<i64> {
        self.travel(self.contact_count).await;
        let mut state = self.state.write().await;
        state.position = self.contact_count;
        state.loaded = true;
        debug!(count = self.contact_count, "simulated platen at contact");
        Ok(self.contact_count)
    }

    async fn move_to(&self, setpoint: i64, tolerance: i64) -> Result<()> {
        self.state.write().await.moves.push(setpoint);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(limit) = self.stall_beyond {
            if setpoint > limit {
                let mut state = self.state.write().await;
                state.position = limit;
                bail!("stepper stalled at {limit} on the way to {setpoint}");
            }
        }
        self.travel(setpoint).await;
        let offset = self.settle_offset.clamp(-tolerance, tolerance);
        self.state.write().await.position = setpoint + offset;
        debug!(setpoint, position = setpoint + offset, "simulated move settled");
        Ok(())
    }

    async fn read_position(&self) -> Result<i64> {
        Ok(self.state.read().await.position)
    }
}

// =============================================================================
// SimulatedForceSensor
// =============================================================================

/// Simulated load cell.
///
/// Scripted readings are consumed first, one `sample` call each. After that
/// the reading follows `offset + stiffness * compression` where compression
/// is the count distance past contact while the platen is loaded.
pub struct SimulatedForceSensor {
    actuator: Option<Arc<SimulatedActuator>>,
    offset: f64,
    stiffness_per_count: f64,
    noise: f64,
    scripted: Mutex<VecDeque<Vec<f64>>>,
    rng: Mutex<StdRng>,
    failing: AtomicBool,
    healthy_calls: AtomicUsize,
}

impl SimulatedForceSensor {
    /// Sensor with a constant reading and no actuator coupling.
    pub fn constant(value: f64) -> Self {
        Self {
            actuator: None,
            offset: value,
            stiffness_per_count: 0.0,
            noise: 0.0,
            scripted: Mutex::new(VecDeque::new()),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            failing: AtomicBool::new(false),
            healthy_calls: AtomicUsize::new(usize::MAX),
        }
    }

    /// Spring model coupled to a simulated actuator.
    pub fn spring(actuator: Arc<SimulatedActuator>, config: &SimulationConfig) -> Self {
        Self {
            actuator: Some(actuator),
            offset: config.force_offset,
            stiffness_per_count: config.stiffness_per_count,
            noise: config.force_noise.abs(),
            scripted: Mutex::new(VecDeque::new()),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed.unwrap_or(0))),
            failing: AtomicBool::new(false),
            healthy_calls: AtomicUsize::new(usize::MAX),
        }
    }

    /// Queue the sample set returned by the next `sample` call.
    pub async fn push_readings(&self, readings: Vec<f64>) {
        self.scripted.lock().await.push_back(readings);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Let `calls` more `sample` calls succeed, then fail every later one.
    pub fn fail_after(&self, calls: usize) {
        self.healthy_calls.store(calls, Ordering::SeqCst);
    }

    async fn model_reading(&self) -> Result<f64> {
        let compression = match &self.actuator {
            Some(actuator) if actuator.is_loaded().await => {
                let position = actuator.read_position().await?;
                (position - actuator.contact_count()).max(0) as f64
            }
            _ => 0.0,
        };
        Ok(self.offset + self.stiffness_per_count * compression)
    }
}

#[async_trait]
impl ForceSensor for SimulatedForceSensor {
    async fn sample(&self, n: usize) -> Result<Vec<f64>> {
        let exhausted = self
            .healthy_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err();
        if exhausted {
            self.failing.store(true, Ordering::SeqCst);
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("amplifier did not respond");
        }
        if let Some(mut readings) = self.scripted.lock().await.pop_front() {
            readings.resize(n, readings.last().copied().unwrap_or_default());
            return Ok(readings);
        }
        let base = self.model_reading().await?;
        let mut rng = self.rng.lock().await;
        Ok((0..n)
            .map(|_| {
                if self.noise > 0.0 {
                    base + rng.gen_range(-self.noise..=self.noise)
                } else {
                    base
                }
            })
            .collect())
    }
}

// =============================================================================
// SimulatedCameras
// =============================================================================

/// Simulated camera array on a rotating carousel.
///
/// Each port writes a 32x24 PNG every `interval` until stopped. A port can be
/// marked faulty to exercise the acquisition failure path.
pub struct SimulatedCameras {
    ports: usize,
    interval: Duration,
    faulty_port: Option<usize>,
    frame_counter: AtomicU64,
    rotation_hz: RwLock<Option<f64>>,
    initialized_with: RwLock<Option<CameraSetting>>,
}

impl SimulatedCameras {
    pub fn new(ports: usize, interval: Duration) -> Self {
        Self {
            ports,
            interval,
            faulty_port: None,
            frame_counter: AtomicU64::new(0),
            rotation_hz: RwLock::new(None),
            initialized_with: RwLock::new(None),
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.ports, Duration::from_millis(config.capture_interval_ms))
    }

    pub fn with_faulty_port(mut self, index: usize) -> Self {
        self.faulty_port = Some(index);
        self
    }

    /// Total frames written across all ports.
    pub fn frames_written(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    pub async fn rotation_hz(&self) -> Option<f64> {
        *self.rotation_hz.read().await
    }

    pub async fn last_setting(&self) -> Option<CameraSetting> {
        self.initialized_with.read().await.clone()
    }

    fn port_name(index: usize) -> String {
        format!("usb:001,{:03}", index + 1)
    }
}

fn write_frame(path: &Path, shade: u8) -> Result<()> {
    let mut img = RgbImage::from_pixel(32, 24, Rgb([20, 20, 20]));
    for y in 8..16 {
        for x in 10..22 {
            img.put_pixel(x, y, Rgb([shade, 200, 40]));
        }
    }
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))
}

#[async_trait]
impl CameraSystem for SimulatedCameras {
    async fn init(&self, setting: &CameraSetting) -> Result<Vec<CameraPort>> {
        *self.initialized_with.write().await = Some(setting.clone());
        Ok((0..self.ports)
            .map(|i| CameraPort(Self::port_name(i)))
            .collect())
    }

    async fn capture_until(
        &self,
        port: &CameraPort,
        dir: &Path,
        stop: Arc<AtomicBool>,
    ) -> Result<Vec<PathBuf>> {
        if let Some(index) = self.faulty_port {
            if port.0 == Self::port_name(index) {
                bail!("camera on {port} stopped responding");
            }
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let mut written = Vec::new();
        while !stop.load(Ordering::SeqCst) {
            let n = self.frame_counter.fetch_add(1, Ordering::SeqCst);
            let path = dir.join(format!("capt{n:06}.png"));
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_frame(&target, (n % 200) as u8 + 40))
                .await
                .map_err(|e| anyhow!("capture task panicked: {e}"))??;
            written.push(path);
            sleep(self.interval).await;
        }
        debug!(%port, frames = written.len(), "simulated capture stopped");
        Ok(written)
    }

    async fn start_rotation(&self, hz: f64) -> Result<()> {
        *self.rotation_hz.write().await = Some(hz);
        Ok(())
    }

    async fn stop_rotation(&self) -> Result<()> {
        *self.rotation_hz.write().await = None;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
