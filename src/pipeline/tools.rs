//! External reconstruction tools.
//!
//! The photogrammetry, point-cloud and mesh-repair algorithms live outside the
//! crate. [`CommandTools`] drives them as executables with a small JSON
//! contract: each invocation gets its own scratch directory holding
//! `request.json`; the tool writes its artifacts there together with
//! `response.json`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::mesh::stl_signed_volume;
use crate::config::ToolCommands;
use crate::model::{
    ClusteringSetting, ColorSetting, MeshExportSetting, PlatenDimensions, PlyExportSetting,
    PlyGenerationSetting, SegmentationSetting,
};

#[derive(Debug, Clone, Serialize)]
pub struct ReconstructRequest {
    pub frames: Vec<PathBuf>,
    pub generation: PlyGenerationSetting,
    pub export: PlyExportSetting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructOutput {
    pub point_cloud: PathBuf,
    /// Reconstruction project, kept alongside the point cloud.
    pub project: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentRequest {
    pub point_cloud: PathBuf,
    pub segmentation: SegmentationSetting,
    pub clustering: ClusteringSetting,
    pub platen: PlatenDimensions,
    pub face_color: ColorSetting,
    pub side_color: ColorSetting,
    /// Platens visible in the scene: 2 around a specimen, 1 under a fixture.
    pub num_platens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentOutput {
    pub point_cloud: PathBuf,
    /// Model units to millimetres, derived from the platen geometry.
    pub scaling_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MeshOutput {
    mesh: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlaneColorsOutput {
    planes: Vec<ColorSetting>,
}

/// Reconstruction operations. Every output path lies inside `work_dir`.
#[async_trait]
pub trait ReconstructionTools: Send + Sync {
    async fn reconstruct(&self, request: &ReconstructRequest, work_dir: &Path) -> Result<ReconstructOutput>;

    async fn segment(&self, request: &SegmentRequest, work_dir: &Path) -> Result<SegmentOutput>;

    /// Surface-reconstruct a processed point cloud into an STL.
    async fn export_mesh(
        &self,
        point_cloud: &Path,
        setting: &MeshExportSetting,
        work_dir: &Path,
    ) -> Result<PathBuf>;

    /// Make an STL watertight.
    async fn repair_mesh(&self, mesh: &Path, work_dir: &Path) -> Result<PathBuf>;

    /// Signed volume of an STL in model units.
    async fn mesh_volume(&self, mesh: &Path) -> Result<f64> {
        stl_signed_volume(mesh).await
    }

    /// Mean and spread colour of the largest planes in a point cloud.
    async fn plane_colors(
        &self,
        point_cloud: &Path,
        segmentation: &SegmentationSetting,
        plane_limit: u32,
        work_dir: &Path,
    ) -> Result<Vec<ColorSetting>>;
}

/// Tools run as configured executables.
#[derive(Debug, Clone)]
pub struct CommandTools {
    commands: ToolCommands,
}

impl CommandTools {
    pub fn new(commands: ToolCommands) -> Self {
        Self { commands }
    }

    async fn invoke<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        name: &str,
        command: &[String],
        request: &Req,
        work_dir: &Path,
    ) -> Result<Resp> {
        let (program, fixed_args) = command
            .split_first()
            .with_context(|| format!("no executable configured for {name}"))?;

        let request_path = work_dir.join("request.json");
        let response_path = work_dir.join("response.json");
        tokio::fs::write(&request_path, serde_json::to_vec_pretty(request)?)
            .await
            .with_context(|| format!("writing {}", request_path.display()))?;

        debug!(tool = name, %program, dir = %work_dir.display(), "invoking tool");
        let output = Command::new(program)
            .args(fixed_args)
            .arg(&request_path)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {program}"))?;

        if !output.status.success() {
            bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let bytes = tokio::fs::read(&response_path)
            .await
            .with_context(|| format!("{program} wrote no {}", response_path.display()))?;
        let response: Resp = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", response_path.display()))?;
        Ok(response)
    }
}

/// Resolve a tool-reported path against its working directory.
fn in_work_dir(work_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        work_dir.join(path)
    }
}

#[async_trait]
impl ReconstructionTools for CommandTools {
    async fn reconstruct(&self, request: &ReconstructRequest, work_dir: &Path) -> Result<ReconstructOutput> {
        let out: ReconstructOutput = self
            .invoke("reconstruct", &self.commands.reconstruct, request, work_dir)
            .await?;
        Ok(ReconstructOutput {
            point_cloud: in_work_dir(work_dir, out.point_cloud),
            project: in_work_dir(work_dir, out.project),
        })
    }

    async fn segment(&self, request: &SegmentRequest, work_dir: &Path) -> Result<SegmentOutput> {
        let out: SegmentOutput = self
            .invoke("segment", &self.commands.segment, request, work_dir)
            .await?;
        if !(out.scaling_factor.is_finite() && out.scaling_factor > 0.0) {
            bail!("segment reported scaling factor {}", out.scaling_factor);
        }
        Ok(SegmentOutput {
            point_cloud: in_work_dir(work_dir, out.point_cloud),
            scaling_factor: out.scaling_factor,
        })
    }

    async fn export_mesh(
        &self,
        point_cloud: &Path,
        setting: &MeshExportSetting,
        work_dir: &Path,
    ) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct Request<'a> {
            point_cloud: &'a Path,
            setting: &'a MeshExportSetting,
        }
        let out: MeshOutput = self
            .invoke(
                "export_mesh",
                &self.commands.export_mesh,
                &Request {
                    point_cloud,
                    setting,
                },
                work_dir,
            )
            .await?;
        Ok(in_work_dir(work_dir, out.mesh))
    }

    async fn repair_mesh(&self, mesh: &Path, work_dir: &Path) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct Request<'a> {
            mesh: &'a Path,
        }
        let out: MeshOutput = self
            .invoke("repair_mesh", &self.commands.repair_mesh, &Request { mesh }, work_dir)
            .await?;
        Ok(in_work_dir(work_dir, out.mesh))
    }

    async fn plane_colors(
        &self,
        point_cloud: &Path,
        segmentation: &SegmentationSetting,
        plane_limit: u32,
        work_dir: &Path,
    ) -> Result<Vec<ColorSetting>> {
        #[derive(Serialize)]
        struct Request<'a> {
            point_cloud: &'a Path,
            segmentation: &'a SegmentationSetting,
            plane_limit: u32,
        }
        let out: PlaneColorsOutput = self
            .invoke(
                "plane_colors",
                &self.commands.plane_colors,
                &Request {
                    point_cloud,
                    segmentation,
                    plane_limit,
                },
                work_dir,
            )
            .await?;
        Ok(out.planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_in_work_dir() {
        let dir = Path::new("/scratch/abc");
        assert_eq!(
            in_work_dir(dir, PathBuf::from("cloud.ply")),
            PathBuf::from("/scratch/abc/cloud.ply")
        );
        assert_eq!(
            in_work_dir(dir, PathBuf::from("/elsewhere/cloud.ply")),
            PathBuf::from("/elsewhere/cloud.ply")
        );
    }

    #[tokio::test]
    async fn test_missing_executable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tools = CommandTools::new(ToolCommands {
            repair_mesh: vec!["rig-test-no-such-tool".into()],
            ..ToolCommands::default()
        });
        let err = tools
            .repair_mesh(Path::new("mesh.stl"), dir.path())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("rig-test-no-such-tool"));
        assert!(dir.path().join("request.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_response_contract() {
        let dir = tempfile::tempdir().unwrap();
        // a shell one-liner standing in for the mesh exporter
        let script = r#"printf '{"mesh":"out.stl"}' > response.json"#;
        let tools = CommandTools::new(ToolCommands {
            export_mesh: vec!["sh".into(), "-c".into(), script.into()],
            ..ToolCommands::default()
        });
        let mesh = tools
            .export_mesh(Path::new("cloud.ply"), &MeshExportSetting::default(), dir.path())
            .await
            .unwrap();
        assert_eq!(mesh, dir.path().join("out.stl"));
    }
}
