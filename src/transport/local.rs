//! Transport into a locally mounted storage directory.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{file_name, Transport};

#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn ensure_remote_dir(&self, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))
    }

    async fn send(&self, files: &[PathBuf], dest: &Path, remove_local: bool) -> Result<()> {
        for file in files {
            let name = file_name(file).ok_or_else(|| anyhow!("no file name in {}", file.display()))?;
            let target = dest.join(&name);
            tokio::fs::copy(file, &target)
                .await
                .with_context(|| format!("copying {} to {}", file.display(), target.display()))?;
            if remove_local {
                tokio::fs::remove_file(file)
                    .await
                    .with_context(|| format!("removing {}", file.display()))?;
            }
        }
        debug!(count = files.len(), dest = %dest.display(), "files copied");
        Ok(())
    }

    async fn verify(&self, dest: &Path, names: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for name in names {
            if !tokio::fs::try_exists(dest.join(name)).await.unwrap_or(false) {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }
}
