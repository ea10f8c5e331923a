//! Rig configuration
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `RIG_`
//! 2. TOML configuration file (default: `config/rig.toml`)
//! 3. Built-in defaults
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! RIG_APPLICATION__LOG_LEVEL=debug
//! RIG_RIG__FORCE_SAMPLES=250
//! RIG_TRANSPORT__MODE=scp
//! ```
//!
//! # Example
//!
//! ```no_run
//! use compression_rig::config::RigConfig;
//!
//! let config = RigConfig::load_from("config/rig.toml")?;
//! println!("Force samples per reading: {}", config.rig.force_samples);
//! # Ok::<(), compression_rig::config::ConfigError>(())
//! ```

pub mod rig_config;

pub use rig_config::{
    AcquisitionConfig, ApplicationConfig, ConfigError, ControllerConfig, PipelineSection,
    RigConfig, SimulationConfig, StoreConfig, ToolCommands, TransportConfig, TransportMode,
};
