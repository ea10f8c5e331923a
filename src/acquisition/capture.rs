//! Synchronized multi-camera capture.
//!
//! One task per camera port captures into a shared directory until a common
//! stop flag is raised at the end of the acquisition window. All tasks are
//! joined before any result is reported.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::hardware::{CameraPort, CameraSystem};

/// Run one acquisition window across `ports` and return every photo written.
///
/// When `rotation_hz` is set the carousel spins for the duration of the
/// window. A failing port fails the whole acquisition, but only after every
/// other port has been stopped and joined.
pub async fn capture_window(
    cameras: Arc<dyn CameraSystem>,
    ports: &[CameraPort],
    dir: &Path,
    window: Duration,
    rotation_hz: Option<f64>,
) -> Result<Vec<PathBuf>> {
    if ports.is_empty() {
        return Err(anyhow!("no camera ports available"));
    }

    if let Some(hz) = rotation_hz {
        cameras.start_rotation(hz).await?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = ports
        .iter()
        .cloned()
        .map(|port| {
            let cameras = cameras.clone();
            let stop = stop.clone();
            let dir = dir.to_path_buf();
            tokio::spawn(async move {
                let result = cameras.capture_until(&port, &dir, stop).await;
                (port, result)
            })
        })
        .collect();

    tokio::time::sleep(window).await;
    stop.store(true, Ordering::SeqCst);
    debug!(ports = ports.len(), "acquisition window closed");

    let joined = join_all(handles).await;

    if rotation_hz.is_some() {
        if let Err(e) = cameras.stop_rotation().await {
            warn!("failed to stop carousel: {e:#}");
        }
    }

    let mut photos = Vec::new();
    let mut first_error = None;
    for outcome in joined {
        match outcome {
            Ok((port, Ok(files))) => {
                debug!(%port, frames = files.len(), "port finished");
                photos.extend(files);
            }
            Ok((port, Err(e))) => {
                warn!(%port, "capture failed: {e:#}");
                first_error.get_or_insert(e.context(format!("capture on {port}")));
            }
            Err(join_err) => {
                first_error.get_or_insert(anyhow!("capture task failed: {join_err}"));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    info!(photos = photos.len(), "acquisition complete");
    Ok(photos)
}
