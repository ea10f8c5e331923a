//! Custom error types for the rig controller and the asset pipeline.
//!
//! `RigError` is the single error type surfaced by the core. Device drivers,
//! transports and external tools report `anyhow::Error` at their trait seams;
//! the controller and the pipeline fold those into the variant matching the
//! failure class, so callers can branch on [`RigError::kind`] instead of
//! parsing messages.
//!
//! ## Error Taxonomy
//!
//! - **`Hardware`**: actuator stall or timeout, sensor read failure. Aborts the
//!   current step; the runner attempts a best-effort rest move.
//! - **`Transport`**: no usable interface, copy failure, or files missing after
//!   a transfer. The step keeps its row but never receives frames.
//! - **`ConfigurationMissing`**: a settings id that does not resolve. Stage-local.
//! - **`ToolFailure`**: an external reconstruction tool failed. Nothing is
//!   recorded, so re-running the stage is safe.
//! - **`DataInconsistency`**: a row violating a model invariant. Treated as
//!   "not ready" by the pipeline and "not runnable" by the runner.
//!
//! Nothing in the crate retries automatically.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::model::{AssetVariant, SettingTable, StepId};

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Hardware fault: {0}")]
    Hardware(String),

    #[error("Transport fault: {0}")]
    Transport(String),

    #[error("{table} setting {id} not found")]
    ConfigurationMissing { table: SettingTable, id: i64 },

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },

    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{variant} already exists for step {step_id} with the same configuration")]
    UniqueViolation {
        step_id: StepId,
        variant: AssetVariant,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Record store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure classes used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    HardwareFault,
    TransportFault,
    ConfigurationMissing,
    ToolFailure,
    DataInconsistency,
    Timeout,
    Configuration,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HardwareFault => "HARDWARE_FAULT",
            ErrorKind::TransportFault => "TRANSPORT_FAULT",
            ErrorKind::ConfigurationMissing => "CONFIGURATION_MISSING",
            ErrorKind::ToolFailure => "TOOL_FAILURE",
            ErrorKind::DataInconsistency => "DATA_INCONSISTENCY",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RigError {
    /// Wrap a driver error as a hardware fault, keeping the full cause chain.
    pub fn hardware(err: anyhow::Error) -> Self {
        RigError::Hardware(format!("{err:#}"))
    }

    /// Wrap a transfer error as a transport fault.
    pub fn transport(err: anyhow::Error) -> Self {
        RigError::Transport(format!("{err:#}"))
    }

    /// Wrap an external tool error.
    pub fn tool(tool: &str, err: anyhow::Error) -> Self {
        RigError::ToolFailure {
            tool: tool.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RigError::Hardware(_) => ErrorKind::HardwareFault,
            RigError::Transport(_) => ErrorKind::TransportFault,
            RigError::ConfigurationMissing { .. } => ErrorKind::ConfigurationMissing,
            RigError::ToolFailure { .. } => ErrorKind::ToolFailure,
            RigError::DataInconsistency(_) => ErrorKind::DataInconsistency,
            RigError::Timeout { .. } => ErrorKind::Timeout,
            RigError::Config(_) | RigError::InvalidConfiguration(_) => ErrorKind::Configuration,
            RigError::NotFound { .. }
            | RigError::UniqueViolation { .. }
            | RigError::Store(_)
            | RigError::Io(_)
            | RigError::Image(_)
            | RigError::Serialization(_) => ErrorKind::Storage,
        }
    }
}

/// Run `fut` under a deadline, reporting expiry as [`RigError::Timeout`].
pub async fn with_timeout<T, F>(operation: impl Into<String>, after: Duration, fut: F) -> RigResult<T>
where
    F: Future<Output = RigResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(RigError::Timeout {
            operation: operation.into(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::Hardware("actuator stalled at 5012".to_string());
        assert_eq!(err.to_string(), "Hardware fault: actuator stalled at 5012");
    }

    #[test]
    fn test_configuration_missing_display() {
        let err = RigError::ConfigurationMissing {
            table: SettingTable::Segmentation,
            id: 42,
        };
        assert_eq!(err.to_string(), "segmentation setting 42 not found");
        assert_eq!(err.kind(), ErrorKind::ConfigurationMissing);
    }

    #[test]
    fn test_wrapped_driver_error_keeps_context() {
        let cause = anyhow::anyhow!("encoder read failed").context("move_to 5095");
        let err = RigError::hardware(cause);
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(err.to_string().contains("move_to 5095"));
        assert!(err.to_string().contains("encoder read failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: RigResult<()> = with_timeout("move to 5095", Duration::from_secs(2), async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "move to 5095 timed out after 2s");
    }

    #[test]
    fn test_tool_failure_kind() {
        let err = RigError::tool("repair_mesh", anyhow::anyhow!("exit status 3"));
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
        assert_eq!(err.kind().as_str(), "TOOL_FAILURE");
    }
}
