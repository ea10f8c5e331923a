//! Moving captured and derived files into durable storage.
//!
//! A transport never guarantees delivery on its own: [`Transport::send`] may
//! return without copying anything (for example when no network interface is
//! up). Callers always follow a send with [`Transport::verify`].

pub mod local;
pub mod scp;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{TransportConfig, TransportMode};

pub use local::LocalTransport;
pub use scp::ScpTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Create `dest` (and parents) if it does not exist.
    async fn ensure_remote_dir(&self, dest: &Path) -> Result<()>;

    /// Copy `files` into `dest`, deleting each local copy after it was sent
    /// when `remove_local` is set.
    async fn send(&self, files: &[PathBuf], dest: &Path, remove_local: bool) -> Result<()>;

    /// Return the subset of `names` that is not present in `dest`.
    async fn verify(&self, dest: &Path, names: &[String]) -> Result<Vec<String>>;
}

/// Build the transport selected by configuration.
pub fn from_config(config: &TransportConfig) -> Arc<dyn Transport> {
    match config.mode {
        TransportMode::Local => Arc::new(LocalTransport::new()),
        TransportMode::Scp => Arc::new(ScpTransport::new(
            config.remote_user.clone(),
            config.remote_host.clone(),
            config.interfaces.clone(),
        )),
    }
}

/// File name component of a path, if it is valid UTF-8.
pub(crate) fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}
