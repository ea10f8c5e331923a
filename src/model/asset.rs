//! Derived assets produced by the reconstruction pipeline.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssetId, SettingId, StepId};

/// A file in durable storage, identified by stem and extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredFile {
    pub name: String,
    pub extension: String,
}

impl StoredFile {
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: extension.into(),
        }
    }

    /// Split a path into stem and extension. Returns `None` for paths without
    /// a UTF-8 file stem.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_stem()?.to_str()?.to_string();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string();
        Some(Self { name, extension })
    }

    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.extension)
        }
    }
}

/// The four asset variants, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetVariant {
    FullPointCloud,
    ProcessedPointCloud,
    RawMesh,
    ProcessedMesh,
}

impl AssetVariant {
    pub const ALL: [AssetVariant; 4] = [
        AssetVariant::FullPointCloud,
        AssetVariant::ProcessedPointCloud,
        AssetVariant::RawMesh,
        AssetVariant::ProcessedMesh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetVariant::FullPointCloud => "full_point_cloud",
            AssetVariant::ProcessedPointCloud => "processed_point_cloud",
            AssetVariant::RawMesh => "raw_mesh",
            AssetVariant::ProcessedMesh => "processed_mesh",
        }
    }

    /// The variant this one is derived from.
    pub fn upstream(&self) -> Option<AssetVariant> {
        match self {
            AssetVariant::FullPointCloud => None,
            AssetVariant::ProcessedPointCloud => Some(AssetVariant::FullPointCloud),
            AssetVariant::RawMesh => Some(AssetVariant::ProcessedPointCloud),
            AssetVariant::ProcessedMesh => Some(AssetVariant::RawMesh),
        }
    }
}

impl fmt::Display for AssetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FullPointCloudKey {
    pub ply_generation: SettingId,
    pub ply_export: SettingId,
    pub crop_color: SettingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedPointCloudKey {
    pub full_point_cloud: AssetId,
    pub segmentation: SettingId,
    pub clustering: SettingId,
    pub platen_dimensions: SettingId,
    pub face_color: SettingId,
    pub side_color: SettingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawMeshKey {
    pub processed_point_cloud: AssetId,
    pub mesh_export: SettingId,
    pub scaling_correction: SettingId,
}

/// Cache key of a derived asset: the settings ids that parameterize it plus
/// the parent asset it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum AssetKey {
    FullPointCloud(FullPointCloudKey),
    ProcessedPointCloud(ProcessedPointCloudKey),
    RawMesh(RawMeshKey),
    ProcessedMesh { raw_mesh: AssetId },
}

impl AssetKey {
    pub fn variant(&self) -> AssetVariant {
        match self {
            AssetKey::FullPointCloud(_) => AssetVariant::FullPointCloud,
            AssetKey::ProcessedPointCloud(_) => AssetVariant::ProcessedPointCloud,
            AssetKey::RawMesh(_) => AssetVariant::RawMesh,
            AssetKey::ProcessedMesh { .. } => AssetVariant::ProcessedMesh,
        }
    }

    pub fn parent(&self) -> Option<AssetId> {
        match self {
            AssetKey::FullPointCloud(_) => None,
            AssetKey::ProcessedPointCloud(key) => Some(key.full_point_cloud),
            AssetKey::RawMesh(key) => Some(key.processed_point_cloud),
            AssetKey::ProcessedMesh { raw_mesh } => Some(*raw_mesh),
        }
    }
}

/// Measurements recorded alongside an asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetrics {
    /// Metric scale of the reconstruction (processed point clouds), or the
    /// combined scale applied to a mesh volume.
    #[serde(default)]
    pub scaling_factor: Option<f64>,
    /// Scaled volume magnitude (meshes only).
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAsset {
    pub id: AssetId,
    pub step_id: StepId,
    pub key: AssetKey,
    pub file: StoredFile,
    /// Reconstruction project saved next to a full point cloud.
    #[serde(default)]
    pub aux_file: Option<StoredFile>,
    #[serde(default)]
    pub metrics: AssetMetrics,
    pub created_at: DateTime<Utc>,
}

impl DerivedAsset {
    pub fn variant(&self) -> AssetVariant {
        self.key.variant()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAsset {
    pub step_id: StepId,
    pub key: AssetKey,
    pub file: StoredFile,
    pub aux_file: Option<StoredFile>,
    pub metrics: AssetMetrics,
}
