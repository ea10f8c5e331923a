//! Typed settings rows.
//!
//! Every reconstruction and acquisition parameter lives in a settings table and
//! is referenced by id. Rows are stored as JSON in the record store and
//! deserialized into these structs when a stage resolves them; a row that does
//! not pass [`SettingRow::validate`] is rejected before any tool runs.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Named settings tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingTable {
    Camera,
    PlyGeneration,
    PlyExport,
    Segmentation,
    Clustering,
    PlatenDimensions,
    Color,
    MeshExport,
    ScalingCorrection,
}

impl SettingTable {
    pub const ALL: [SettingTable; 9] = [
        SettingTable::Camera,
        SettingTable::PlyGeneration,
        SettingTable::PlyExport,
        SettingTable::Segmentation,
        SettingTable::Clustering,
        SettingTable::PlatenDimensions,
        SettingTable::Color,
        SettingTable::MeshExport,
        SettingTable::ScalingCorrection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingTable::Camera => "camera",
            SettingTable::PlyGeneration => "ply_generation",
            SettingTable::PlyExport => "ply_export",
            SettingTable::Segmentation => "segmentation",
            SettingTable::Clustering => "clustering",
            SettingTable::PlatenDimensions => "platen_dimensions",
            SettingTable::Color => "color",
            SettingTable::MeshExport => "mesh_export",
            SettingTable::ScalingCorrection => "scaling_correction",
        }
    }
}

impl fmt::Display for SettingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row type stored in one settings table.
pub trait SettingRow: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: SettingTable;

    /// Check field ranges. The message names the offending field.
    fn validate(&self) -> Result<(), String>;
}

fn positive(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(format!("{field} must be a positive finite number, got {value}"))
    }
}

/// Camera driver configuration. Values are driver choice indices, not
/// physical units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSetting {
    pub autopoweroff: i32,
    pub capture: i32,
    pub imageformat: i32,
    pub iso: i32,
    pub focusmode: i32,
    pub aspectratio: i32,
    pub aperture: i32,
    pub shutterspeed: i32,
}

impl Default for CameraSetting {
    fn default() -> Self {
        Self {
            autopoweroff: 0,
            capture: 0,
            imageformat: 0,
            iso: 10,
            focusmode: 0,
            aspectratio: 0,
            aperture: 4,
            shutterspeed: 37,
        }
    }
}

impl SettingRow for CameraSetting {
    const TABLE: SettingTable = SettingTable::Camera;

    fn validate(&self) -> Result<(), String> {
        let fields = [
            ("autopoweroff", self.autopoweroff),
            ("capture", self.capture),
            ("imageformat", self.imageformat),
            ("iso", self.iso),
            ("focusmode", self.focusmode),
            ("aspectratio", self.aspectratio),
            ("aperture", self.aperture),
            ("shutterspeed", self.shutterspeed),
        ];
        match fields.iter().find(|(_, value)| *value < 0) {
            Some((name, value)) => Err(format!("{name} choice index must be >= 0, got {value}")),
            None => Ok(()),
        }
    }
}

/// Dense point cloud generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlyGenerationSetting {
    /// Image downscale factor used for matching (1 = full resolution).
    pub downscale: u32,
    pub keypoint_limit: u32,
    pub tiepoint_limit: u32,
    pub filter_mode: String,
    /// `k` in the crop mask `mean ± k·stdev`.
    pub crop_stdev_multiplier: f64,
}

impl Default for PlyGenerationSetting {
    fn default() -> Self {
        Self {
            downscale: 1,
            keypoint_limit: 40_000,
            tiepoint_limit: 4_000,
            filter_mode: "moderate".to_string(),
            crop_stdev_multiplier: 3.0,
        }
    }
}

impl SettingRow for PlyGenerationSetting {
    const TABLE: SettingTable = SettingTable::PlyGeneration;

    fn validate(&self) -> Result<(), String> {
        if self.downscale == 0 {
            return Err("downscale must be >= 1".to_string());
        }
        if self.keypoint_limit < self.tiepoint_limit {
            return Err(format!(
                "keypoint_limit ({}) must not be below tiepoint_limit ({})",
                self.keypoint_limit, self.tiepoint_limit
            ));
        }
        positive("crop_stdev_multiplier", self.crop_stdev_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlyExportSetting {
    pub save_colors: bool,
    pub save_normals: bool,
    pub binary: bool,
}

impl Default for PlyExportSetting {
    fn default() -> Self {
        Self {
            save_colors: true,
            save_normals: true,
            binary: true,
        }
    }
}

impl SettingRow for PlyExportSetting {
    const TABLE: SettingTable = SettingTable::PlyExport;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// RANSAC plane segmentation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationSetting {
    pub distance_threshold: f64,
    pub ransac_n: u32,
    pub num_iterations: u32,
}

impl Default for SegmentationSetting {
    fn default() -> Self {
        Self {
            distance_threshold: 0.01,
            ransac_n: 3,
            num_iterations: 1000,
        }
    }
}

impl SettingRow for SegmentationSetting {
    const TABLE: SettingTable = SettingTable::Segmentation;

    fn validate(&self) -> Result<(), String> {
        positive("distance_threshold", self.distance_threshold)?;
        if self.ransac_n < 3 {
            return Err(format!("ransac_n must be >= 3, got {}", self.ransac_n));
        }
        if self.num_iterations == 0 {
            return Err("num_iterations must be >= 1".to_string());
        }
        Ok(())
    }
}

/// DBSCAN clustering parameters used to separate platens from the specimen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringSetting {
    pub eps: f64,
    pub min_points: u32,
}

impl Default for ClusteringSetting {
    fn default() -> Self {
        Self {
            eps: 0.05,
            min_points: 10,
        }
    }
}

impl SettingRow for ClusteringSetting {
    const TABLE: SettingTable = SettingTable::Clustering;

    fn validate(&self) -> Result<(), String> {
        positive("eps", self.eps)?;
        if self.min_points == 0 {
            return Err("min_points must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Physical platen geometry, the metric reference for scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatenDimensions {
    pub diameter_mm: f64,
    pub thickness_mm: f64,
}

impl Default for PlatenDimensions {
    fn default() -> Self {
        Self {
            diameter_mm: 100.0,
            thickness_mm: 10.0,
        }
    }
}

impl SettingRow for PlatenDimensions {
    const TABLE: SettingTable = SettingTable::PlatenDimensions;

    fn validate(&self) -> Result<(), String> {
        positive("diameter_mm", self.diameter_mm)?;
        positive("thickness_mm", self.thickness_mm)
    }
}

/// Mean and standard deviation of a surface colour, RGB in `[0, 255]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorSetting {
    pub mean: [f64; 3],
    pub stdev: [f64; 3],
}

impl Default for ColorSetting {
    fn default() -> Self {
        Self {
            mean: [127.5, 127.5, 127.5],
            stdev: [42.5, 42.5, 42.5],
        }
    }
}

impl SettingRow for ColorSetting {
    const TABLE: SettingTable = SettingTable::Color;

    fn validate(&self) -> Result<(), String> {
        for (channel, (mean, stdev)) in self.mean.iter().zip(self.stdev.iter()).enumerate() {
            if !(0.0..=255.0).contains(mean) {
                return Err(format!("mean[{channel}] must lie in [0, 255], got {mean}"));
            }
            if !stdev.is_finite() || *stdev < 0.0 {
                return Err(format!("stdev[{channel}] must be >= 0, got {stdev}"));
            }
        }
        Ok(())
    }
}

/// Surface reconstruction parameters for STL export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshExportSetting {
    pub poisson_depth: u32,
    /// Vertices below this density quantile are trimmed.
    pub density_quantile: f64,
}

impl Default for MeshExportSetting {
    fn default() -> Self {
        Self {
            poisson_depth: 9,
            density_quantile: 0.05,
        }
    }
}

impl SettingRow for MeshExportSetting {
    const TABLE: SettingTable = SettingTable::MeshExport;

    fn validate(&self) -> Result<(), String> {
        if !(1..=16).contains(&self.poisson_depth) {
            return Err(format!(
                "poisson_depth must lie in 1..=16, got {}",
                self.poisson_depth
            ));
        }
        if !(0.0..1.0).contains(&self.density_quantile) {
            return Err(format!(
                "density_quantile must lie in [0, 1), got {}",
                self.density_quantile
            ));
        }
        Ok(())
    }
}

/// Empirical multiplier applied on top of the platen-derived scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingCorrection {
    pub factor: f64,
}

impl Default for ScalingCorrection {
    fn default() -> Self {
        Self { factor: 1.0 }
    }
}

impl SettingRow for ScalingCorrection {
    const TABLE: SettingTable = SettingTable::ScalingCorrection;

    fn validate(&self) -> Result<(), String> {
        positive("factor", self.factor)
    }
}
