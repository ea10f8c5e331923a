//! Entities persisted by the record store.
//!
//! The core only ever holds short-lived copies of these rows; the store is the
//! owner. Trials own steps, steps own frames and derived assets.

pub mod asset;
pub mod settings;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use asset::{
    AssetKey, AssetMetrics, AssetVariant, DerivedAsset, FullPointCloudKey, NewAsset,
    ProcessedPointCloudKey, RawMeshKey, StoredFile,
};
pub use settings::{
    CameraSetting, ClusteringSetting, ColorSetting, MeshExportSetting, PlatenDimensions,
    PlyExportSetting, PlyGenerationSetting, ScalingCorrection, SegmentationSetting, SettingRow,
    SettingTable,
};

use crate::error::{RigError, RigResult};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

row_id!(
    /// Compression trial row id.
    TrialId
);
row_id!(
    /// Strain step row id.
    StepId
);
row_id!(
    /// Captured frame row id.
    FrameId
);
row_id!(
    /// Derived asset row id (shared id space across the four variants).
    AssetId
);
row_id!(
    /// Settings row id, unique within its table.
    SettingId
);
row_id!(
    /// Printed specimen row id.
    SpecimenId
);
row_id!(
    /// Calibration fixture (phantom) row id.
    FixtureId
);

/// What a trial compresses: a specimen, or a calibration fixture that is only
/// photographed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialSubject {
    Specimen(SpecimenId),
    Fixture(FixtureId),
}

impl TrialSubject {
    pub fn is_calibration(&self) -> bool {
        matches!(self, TrialSubject::Fixture(_))
    }
}

/// One specimen run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Unique name; also the trial's directory in durable storage.
    pub name: String,
    pub strain_limit: f64,
    pub strain_delta: f64,
    pub force_limit: f64,
    #[serde(default = "default_force_unit")]
    pub force_unit: String,
    /// Mean unloaded force reading, back-filled during zeroing.
    #[serde(default)]
    pub force_zero: Option<f64>,
    #[serde(default)]
    pub specimen_id: Option<SpecimenId>,
    #[serde(default)]
    pub fixture_id: Option<FixtureId>,
    /// Frames kept per step; 0 keeps every captured frame.
    pub frames_per_step: u32,
    pub created_at: DateTime<Utc>,
}

fn default_force_unit() -> String {
    "N".to_string()
}

impl Trial {
    /// Resolve the specimen/fixture reference.
    ///
    /// Exactly one of the two must be set; anything else is a data
    /// inconsistency in the store.
    pub fn subject(&self) -> RigResult<TrialSubject> {
        match (self.specimen_id, self.fixture_id) {
            (Some(specimen), None) => Ok(TrialSubject::Specimen(specimen)),
            (None, Some(fixture)) => Ok(TrialSubject::Fixture(fixture)),
            (None, None) => Err(RigError::DataInconsistency(format!(
                "trial {} has neither a specimen nor a fixture",
                self.id
            ))),
            (Some(_), Some(_)) => Err(RigError::DataInconsistency(format!(
                "trial {} references both a specimen and a fixture",
                self.id
            ))),
        }
    }

    /// Number of steps a complete specimen run records, 0 for a schedule the
    /// runner would refuse.
    pub fn steps_required(&self) -> usize {
        crate::units::strain_step_count(self.strain_limit, self.strain_delta).unwrap_or(0)
    }
}

/// Fields supplied when creating a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrial {
    pub name: String,
    pub strain_limit: f64,
    pub strain_delta: f64,
    pub force_limit: f64,
    pub force_unit: String,
    pub subject: NewTrialSubject,
    pub frames_per_step: u32,
}

/// Serializable form of [`TrialSubject`] for trial creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewTrialSubject {
    Specimen(SpecimenId),
    Fixture(FixtureId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specimen {
    pub id: SpecimenId,
    pub name: String,
    pub geometry_units: String,
    /// Height measured by the encoder during zeroing.
    #[serde(default)]
    pub height_mm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: FixtureId,
    pub name: String,
    /// Known volume of the phantom, in `geometry_units` cubed.
    pub volume: f64,
    pub geometry_units: String,
}

/// One strain increment of a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub trial_id: TrialId,
    pub name: String,
    pub strain_target: f64,
    /// Strain realized according to the encoder; `None` for calibration steps
    /// and for steps aborted before the measurement.
    #[serde(default)]
    pub strain_measured: Option<f64>,
    #[serde(default)]
    pub force: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStep {
    pub trial_id: TrialId,
    pub name: String,
    pub strain_target: f64,
}

/// One captured image in durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    pub step_id: StepId,
    pub camera_setting_id: SettingId,
    pub file: StoredFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFrame {
    pub step_id: StepId,
    pub camera_setting_id: SettingId,
    pub file: StoredFile,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(specimen: Option<i64>, fixture: Option<i64>) -> Trial {
        Trial {
            id: TrialId(7),
            name: "t".into(),
            strain_limit: 0.8,
            strain_delta: 0.1,
            force_limit: 1000.0,
            force_unit: "N".into(),
            force_zero: None,
            specimen_id: specimen.map(SpecimenId),
            fixture_id: fixture.map(FixtureId),
            frames_per_step: 100,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_subject_specimen() {
        assert_eq!(
            trial(Some(3), None).subject().unwrap(),
            TrialSubject::Specimen(SpecimenId(3))
        );
    }

    #[test]
    fn test_subject_fixture_is_calibration() {
        let subject = trial(None, Some(2)).subject().unwrap();
        assert!(subject.is_calibration());
    }

    #[test]
    fn test_subject_requires_exactly_one() {
        let neither = trial(None, None).subject().unwrap_err();
        assert!(matches!(neither, RigError::DataInconsistency(_)));
        let both = trial(Some(1), Some(1)).subject().unwrap_err();
        assert!(both.to_string().contains("both"));
    }

    #[test]
    fn test_steps_required_counts_without_building_schedule() {
        let mut t = trial(Some(1), None);
        t.strain_limit = 0.25;
        assert_eq!(t.steps_required(), 4);
        t.strain_delta = 1e-20;
        assert_eq!(t.steps_required(), 0);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&StepId(12)).unwrap();
        assert_eq!(json, "12");
    }
}
