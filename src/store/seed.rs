//! Default settings rows.

use serde::Serialize;
use tracing::info;

use super::{upsert_setting_row, RecordStore};
use crate::error::RigResult;
use crate::model::{
    CameraSetting, ClusteringSetting, ColorSetting, MeshExportSetting, PlatenDimensions,
    PlyExportSetting, PlyGenerationSetting, ScalingCorrection, SegmentationSetting, SettingId,
};

/// Ids of the default row in each settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DefaultSettings {
    pub camera: SettingId,
    pub ply_generation: SettingId,
    pub ply_export: SettingId,
    pub segmentation: SettingId,
    pub clustering: SettingId,
    pub platen_dimensions: SettingId,
    pub color: SettingId,
    pub mesh_export: SettingId,
    pub scaling_correction: SettingId,
}

/// Upsert the default row of every settings table. Safe to call repeatedly;
/// existing identical rows are reused.
pub async fn seed_defaults(store: &dyn RecordStore) -> RigResult<DefaultSettings> {
    let ids = DefaultSettings {
        camera: upsert_setting_row(store, &CameraSetting::default()).await?,
        ply_generation: upsert_setting_row(store, &PlyGenerationSetting::default()).await?,
        ply_export: upsert_setting_row(store, &PlyExportSetting::default()).await?,
        segmentation: upsert_setting_row(store, &SegmentationSetting::default()).await?,
        clustering: upsert_setting_row(store, &ClusteringSetting::default()).await?,
        platen_dimensions: upsert_setting_row(store, &PlatenDimensions::default()).await?,
        color: upsert_setting_row(store, &ColorSetting::default()).await?,
        mesh_export: upsert_setting_row(store, &MeshExportSetting::default()).await?,
        scaling_correction: upsert_setting_row(store, &ScalingCorrection::default()).await?,
    };
    info!(camera = %ids.camera, "default settings seeded");
    Ok(ids)
}
