//! Strongly-typed rig configuration loaded with Figment.
//!
//! Every section has defaults matching the bench rig, so an absent file or
//! section yields a usable configuration. Loaded values are validated before
//! they are handed out.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Actuator and force sensor behaviour
    #[serde(default)]
    pub rig: ControllerConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (text, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "compression-rig".to_string(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Closed-loop actuator and force sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Allowed |position - setpoint| in encoder counts when a move settles
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: i64,
    /// Pause between a settled move and the force reading
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Force sensor samples averaged per reading (at least 100)
    #[serde(default = "default_force_samples")]
    pub force_samples: usize,
    #[serde(default = "default_move_timeout")]
    pub move_timeout_ms: u64,
    /// Encoder count the crush platen parks at after a trial
    #[serde(default = "default_rest_setpoint")]
    pub rest_setpoint: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            position_tolerance: default_position_tolerance(),
            settle_delay_ms: default_settle_delay(),
            force_samples: default_force_samples(),
            move_timeout_ms: default_move_timeout(),
            rest_setpoint: default_rest_setpoint(),
        }
    }
}

impl ControllerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }
}

/// Camera acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Wall-clock length of one capture window
    #[serde(default = "default_window")]
    pub window_ms: u64,
    #[serde(default = "default_seconds_per_photo")]
    pub seconds_per_photo: f64,
    /// Carousel stepper steps per full rotation
    #[serde(default = "default_steps_per_rotation")]
    pub steps_per_rotation: u32,
    /// Local directory the cameras write into
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    /// Spin the camera carousel during capture
    #[serde(default = "default_true")]
    pub rotate_cameras: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window(),
            seconds_per_photo: default_seconds_per_photo(),
            steps_per_rotation: default_steps_per_rotation(),
            capture_dir: default_capture_dir(),
            rotate_cameras: true,
        }
    }
}

impl AcquisitionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Durable storage is a mounted directory
    Local,
    /// Durable storage is reached with scp over a bound interface
    Scp,
}

/// File transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_mode")]
    pub mode: TransportMode,
    /// Network interfaces in priority order
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub remote_user: String,
    #[serde(default)]
    pub remote_host: String,
    /// Root of durable storage; each trial gets a directory named after it
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: default_transport_mode(),
            interfaces: default_interfaces(),
            remote_user: String::new(),
            remote_host: String::new(),
            storage_root: default_storage_root(),
            timeout_secs: default_transfer_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Executables invoked for each reconstruction stage. Each entry is a
/// program followed by fixed leading arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCommands {
    #[serde(default = "default_reconstruct_cmd")]
    pub reconstruct: Vec<String>,
    #[serde(default = "default_segment_cmd")]
    pub segment: Vec<String>,
    #[serde(default = "default_export_mesh_cmd")]
    pub export_mesh: Vec<String>,
    #[serde(default = "default_repair_mesh_cmd")]
    pub repair_mesh: Vec<String>,
    #[serde(default = "default_plane_colors_cmd")]
    pub plane_colors: Vec<String>,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            reconstruct: default_reconstruct_cmd(),
            segment: default_segment_cmd(),
            export_mesh: default_export_mesh_cmd(),
            repair_mesh: default_repair_mesh_cmd(),
            plane_colors: default_plane_colors_cmd(),
        }
    }
}

/// Reconstruction pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Parent of the per-invocation scratch directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Local view of durable storage holding frames and assets
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Trials processed at once by `process_trials`
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub tools: ToolCommands,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            storage_root: default_storage_root(),
            tool_timeout_secs: default_tool_timeout(),
            concurrency: default_concurrency(),
            tools: ToolCommands::default(),
        }
    }
}

impl PipelineSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot the record store is loaded from and saved to
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Parameters of the simulated rig used by `simulate-trial`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Encoder count reported after homing
    #[serde(default = "default_home_count")]
    pub home_count: i64,
    /// Encoder count at which the platen touches the specimen
    #[serde(default = "default_contact_count")]
    pub contact_count: i64,
    /// Unloaded force sensor reading
    #[serde(default)]
    pub force_offset: f64,
    /// Force added per encoder count of compression past contact
    #[serde(default = "default_stiffness")]
    pub stiffness_per_count: f64,
    /// Uniform noise amplitude on each force sample
    #[serde(default)]
    pub force_noise: f64,
    #[serde(default = "default_ports")]
    pub ports: usize,
    #[serde(default = "default_capture_interval")]
    pub capture_interval_ms: u64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            home_count: default_home_count(),
            contact_count: default_contact_count(),
            force_offset: 0.0,
            stiffness_per_count: default_stiffness(),
            force_noise: 0.0,
            ports: default_ports(),
            capture_interval_ms: default_capture_interval(),
            seed: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_position_tolerance() -> i64 {
    1
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_force_samples() -> usize {
    100
}

fn default_move_timeout() -> u64 {
    120_000
}

fn default_rest_setpoint() -> i64 {
    5
}

fn default_window() -> u64 {
    60_000
}

fn default_seconds_per_photo() -> f64 {
    1.0
}

fn default_steps_per_rotation() -> u32 {
    54_600
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("captures")
}

fn default_true() -> bool {
    true
}

fn default_transport_mode() -> TransportMode {
    TransportMode::Local
}

fn default_interfaces() -> Vec<String> {
    vec!["eth0".to_string(), "wlan0".to_string()]
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/trials")
}

fn default_transfer_timeout() -> u64 {
    600
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("compression-rig")
}

fn default_tool_timeout() -> u64 {
    3600
}

fn default_concurrency() -> usize {
    1
}

fn default_reconstruct_cmd() -> Vec<String> {
    vec!["rig-reconstruct".to_string()]
}

fn default_segment_cmd() -> Vec<String> {
    vec!["rig-segment".to_string()]
}

fn default_export_mesh_cmd() -> Vec<String> {
    vec!["rig-export-mesh".to_string()]
}

fn default_repair_mesh_cmd() -> Vec<String> {
    vec!["rig-repair-mesh".to_string()]
}

fn default_plane_colors_cmd() -> Vec<String> {
    vec!["rig-plane-colors".to_string()]
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/rig-store.json")
}

fn default_home_count() -> i64 {
    7776
}

fn default_contact_count() -> i64 {
    4797
}

fn default_stiffness() -> f64 {
    0.5
}

fn default_ports() -> usize {
    2
}

fn default_capture_interval() -> u64 {
    1000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path. A missing file falls back
    /// to defaults; environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RIG_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.rig.force_samples < 100 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid force_samples {}. At least 100 samples are required",
                self.rig.force_samples
            )));
        }

        if self.rig.position_tolerance < 0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid position_tolerance {}. Must be >= 0",
                self.rig.position_tolerance
            )));
        }

        if self.rig.move_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "move_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.acquisition.window_ms == 0 {
            return Err(ConfigError::ValidationError(
                "acquisition window_ms must be > 0".to_string(),
            ));
        }

        let seconds_per_photo = self.acquisition.seconds_per_photo;
        if seconds_per_photo.is_nan() || seconds_per_photo <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid seconds_per_photo {}. Must be > 0",
                self.acquisition.seconds_per_photo
            )));
        }

        if self.acquisition.steps_per_rotation == 0 {
            return Err(ConfigError::ValidationError(
                "steps_per_rotation must be > 0".to_string(),
            ));
        }

        if self.transport.mode == TransportMode::Scp {
            if self.transport.remote_host.is_empty() || self.transport.remote_user.is_empty() {
                return Err(ConfigError::ValidationError(
                    "scp transport requires 'remote_user' and 'remote_host'".to_string(),
                ));
            }
            if self.transport.interfaces.is_empty() {
                return Err(ConfigError::ValidationError(
                    "scp transport requires at least one interface".to_string(),
                ));
            }
        }

        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline concurrency must be >= 1".to_string(),
            ));
        }

        if self.pipeline.tool_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tool_timeout_secs must be > 0".to_string(),
            ));
        }

        let tools = &self.pipeline.tools;
        for (name, command) in [
            ("reconstruct", &tools.reconstruct),
            ("segment", &tools.segment),
            ("export_mesh", &tools.export_mesh),
            ("repair_mesh", &tools.repair_mesh),
            ("plane_colors", &tools.plane_colors),
        ] {
            if command.first().map_or(true, |program| program.is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "Tool command '{name}' cannot be empty"
                )));
            }
        }

        if self.simulation.ports == 0 {
            return Err(ConfigError::ValidationError(
                "simulation ports must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RigConfig::default();
        config.application.log_level = "invalid".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_force_samples_below_minimum() {
        let mut config = RigConfig::default();
        config.rig.force_samples = 99;

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("force_samples 99"));
    }

    #[test]
    fn test_scp_requires_remote() {
        let mut config = RigConfig::default();
        config.transport.mode = TransportMode::Scp;
        assert!(config.validate().is_err());

        config.transport.remote_user = "lab".to_string();
        config.transport.remote_host = "192.168.1.2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_tool_command_rejected() {
        let mut config = RigConfig::default();
        config.pipeline.tools.segment = vec![];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("segment"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench"
log_level = "debug"

[rig]
force_samples = 250
rest_setpoint = 12

[transport]
mode = "local"
storage_root = "/srv/trials"
"#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.rig.force_samples, 250);
        assert_eq!(config.rig.rest_setpoint, 12);
        assert_eq!(config.rig.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.transport.storage_root, PathBuf::from("/srv/trials"));
        assert_eq!(config.acquisition.steps_per_rotation, 54_600);
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rig]\nforce_samples = 10").unwrap();

        let result = RigConfig::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_retired_actuator_duty_key_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rig]\nforce_samples = 120\nactuator_duty = 85").unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.rig.force_samples, 120);
        let rig = serde_json::to_value(&config.rig).unwrap();
        assert!(rig.get("actuator_duty").is_none());
    }
}
