//! In-process reconstruction tools for tests and `simulate-trial`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::mesh::{box_with_volume, to_ascii_stl};
use super::tools::{ReconstructOutput, ReconstructRequest, ReconstructionTools, SegmentOutput, SegmentRequest};
use crate::model::{ColorSetting, MeshExportSetting, SegmentationSetting};

/// Per-operation invocation counts.
#[derive(Debug, Default)]
pub struct ToolCalls {
    pub reconstruct: AtomicUsize,
    pub segment: AtomicUsize,
    pub export_mesh: AtomicUsize,
    pub repair_mesh: AtomicUsize,
    pub plane_colors: AtomicUsize,
}

/// Writes small placeholder artifacts and meshes of a configured volume.
pub struct MockTools {
    calls: ToolCalls,
    scaling_factor: f64,
    raw_volume: f64,
    repaired_volume: f64,
    planes: Vec<ColorSetting>,
    failing: Mutex<Option<&'static str>>,
    last_platens: Mutex<Option<u32>>,
}

impl Default for MockTools {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTools {
    pub fn new() -> Self {
        Self {
            calls: ToolCalls::default(),
            scaling_factor: 5.0,
            raw_volume: 1000.0,
            repaired_volume: 1000.0,
            planes: vec![
                ColorSetting {
                    mean: [200.0, 30.0, 30.0],
                    stdev: [12.0, 8.0, 8.0],
                },
                ColorSetting {
                    mean: [30.0, 30.0, 200.0],
                    stdev: [8.0, 8.0, 12.0],
                },
            ],
            failing: Mutex::new(None),
            last_platens: Mutex::new(None),
        }
    }

    /// Scaling factor reported by segmentation.
    pub fn with_scaling_factor(mut self, factor: f64) -> Self {
        self.scaling_factor = factor;
        self
    }

    /// Signed volume of exported meshes, in model units.
    pub fn with_raw_volume(mut self, volume: f64) -> Self {
        self.raw_volume = volume;
        self
    }

    /// Signed volume of repaired meshes, in model units.
    pub fn with_repaired_volume(mut self, volume: f64) -> Self {
        self.repaired_volume = volume;
        self
    }

    pub fn with_planes(mut self, planes: Vec<ColorSetting>) -> Self {
        self.planes = planes;
        self
    }

    /// Make the named operation fail until cleared with `None`.
    pub fn set_failing(&self, tool: Option<&'static str>) {
        if let Ok(mut failing) = self.failing.lock() {
            *failing = tool;
        }
    }

    pub fn calls(&self) -> &ToolCalls {
        &self.calls
    }

    /// Total invocations across every operation.
    pub fn total_calls(&self) -> usize {
        [
            &self.calls.reconstruct,
            &self.calls.segment,
            &self.calls.export_mesh,
            &self.calls.repair_mesh,
            &self.calls.plane_colors,
        ]
        .iter()
        .map(|count| count.load(Ordering::SeqCst))
        .sum()
    }

    /// Platen count passed to the most recent segmentation.
    pub fn last_platens(&self) -> Option<u32> {
        self.last_platens.lock().ok().and_then(|guard| *guard)
    }

    fn enter(&self, tool: &'static str, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing.lock().ok().and_then(|guard| *guard);
        if failing == Some(tool) {
            bail!("{tool} failed (injected)");
        }
        Ok(())
    }
}

async fn write_placeholder(path: PathBuf, body: &str) -> Result<PathBuf> {
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

async fn write_box(path: PathBuf, volume: f64) -> Result<PathBuf> {
    tokio::fs::write(&path, to_ascii_stl("mock", &box_with_volume(volume))).await?;
    Ok(path)
}

#[async_trait]
impl ReconstructionTools for MockTools {
    async fn reconstruct(&self, request: &ReconstructRequest, work_dir: &Path) -> Result<ReconstructOutput> {
        self.enter("reconstruct", &self.calls.reconstruct)?;
        if request.frames.is_empty() {
            bail!("no frames to reconstruct");
        }
        let point_cloud = write_placeholder(
            work_dir.join("cloud.ply"),
            &format!("ply\ncomment frames {}\nend_header\n", request.frames.len()),
        )
        .await?;
        let project = write_placeholder(work_dir.join("project.psx"), "<document/>\n").await?;
        Ok(ReconstructOutput {
            point_cloud,
            project,
        })
    }

    async fn segment(&self, request: &SegmentRequest, work_dir: &Path) -> Result<SegmentOutput> {
        self.enter("segment", &self.calls.segment)?;
        if let Ok(mut last) = self.last_platens.lock() {
            *last = Some(request.num_platens);
        }
        let point_cloud =
            write_placeholder(work_dir.join("processed.ply"), "ply\nend_header\n").await?;
        Ok(SegmentOutput {
            point_cloud,
            scaling_factor: self.scaling_factor,
        })
    }

    async fn export_mesh(
        &self,
        _point_cloud: &Path,
        _setting: &MeshExportSetting,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        self.enter("export_mesh", &self.calls.export_mesh)?;
        write_box(work_dir.join("raw.stl"), self.raw_volume).await
    }

    async fn repair_mesh(&self, _mesh: &Path, work_dir: &Path) -> Result<PathBuf> {
        self.enter("repair_mesh", &self.calls.repair_mesh)?;
        write_box(work_dir.join("repaired.stl"), self.repaired_volume).await
    }

    async fn plane_colors(
        &self,
        _point_cloud: &Path,
        _segmentation: &SegmentationSetting,
        plane_limit: u32,
        _work_dir: &Path,
    ) -> Result<Vec<ColorSetting>> {
        self.enter("plane_colors", &self.calls.plane_colors)?;
        Ok(self.planes.iter().take(plane_limit as usize).cloned().collect())
    }
}
