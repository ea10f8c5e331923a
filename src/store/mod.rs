//! Record store interface.
//!
//! The store owns every persisted entity. Each trait method is one unit of
//! work: it either applies completely or not at all. Implementations must
//! enforce the derived-asset uniqueness constraint on `(step, key)` and report
//! a conflicting insert as [`RigError::UniqueViolation`].

pub mod memory;
pub mod seed;

use async_trait::async_trait;

use crate::error::{RigError, RigResult};
use crate::model::{
    AssetKey, DerivedAsset, Fixture, FixtureId, Frame, NewAsset, NewFrame, NewStep, NewTrial,
    SettingId, SettingRow, SettingTable, Specimen, SpecimenId, Step, StepId, Trial, TrialId,
};

pub use memory::MemoryStore;
pub use seed::{seed_defaults, DefaultSettings};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_trial(&self, trial: NewTrial) -> RigResult<Trial>;
    async fn trial(&self, id: TrialId) -> RigResult<Option<Trial>>;
    /// Back-fill the unloaded force reading measured during zeroing.
    async fn set_force_zero(&self, id: TrialId, force_zero: f64) -> RigResult<()>;

    async fn create_specimen(&self, name: &str, geometry_units: &str) -> RigResult<Specimen>;
    async fn specimen(&self, id: SpecimenId) -> RigResult<Option<Specimen>>;
    async fn set_specimen_height(&self, id: SpecimenId, height_mm: f64) -> RigResult<()>;

    async fn create_fixture(
        &self,
        name: &str,
        volume: f64,
        geometry_units: &str,
    ) -> RigResult<Fixture>;
    async fn fixture(&self, id: FixtureId) -> RigResult<Option<Fixture>>;

    async fn insert_step(&self, step: NewStep) -> RigResult<Step>;
    async fn step(&self, id: StepId) -> RigResult<Option<Step>>;
    /// Steps of a trial in ascending target strain.
    async fn steps_for_trial(&self, trial: TrialId) -> RigResult<Vec<Step>>;
    /// Store the encoder strain and mean force of a step. A step is measured
    /// at most once.
    async fn record_measurement(&self, step: StepId, strain: f64, force: f64) -> RigResult<()>;

    /// Insert a step's frames as one batch.
    async fn insert_frames(&self, frames: Vec<NewFrame>) -> RigResult<Vec<Frame>>;
    async fn frames_for_step(&self, step: StepId) -> RigResult<Vec<Frame>>;

    async fn find_asset(&self, step: StepId, key: &AssetKey) -> RigResult<Option<DerivedAsset>>;
    async fn insert_asset(&self, asset: NewAsset) -> RigResult<DerivedAsset>;
    async fn assets_for_step(&self, step: StepId) -> RigResult<Vec<DerivedAsset>>;

    async fn fetch_setting(
        &self,
        table: SettingTable,
        id: SettingId,
    ) -> RigResult<Option<serde_json::Value>>;
    /// Insert a settings row, or return the id of an identical existing row.
    async fn upsert_setting(
        &self,
        table: SettingTable,
        value: serde_json::Value,
    ) -> RigResult<SettingId>;
}

/// Fetch a trial that must exist.
pub async fn require_trial(store: &dyn RecordStore, id: TrialId) -> RigResult<Trial> {
    store.trial(id).await?.ok_or(RigError::NotFound {
        entity: "trial",
        id: id.0,
    })
}

/// Fetch a step that must exist.
pub async fn require_step(store: &dyn RecordStore, id: StepId) -> RigResult<Step> {
    store.step(id).await?.ok_or(RigError::NotFound {
        entity: "step",
        id: id.0,
    })
}

/// Resolve a settings id into its typed row.
///
/// A missing row is [`RigError::ConfigurationMissing`]; a row that does not
/// deserialize or validate is [`RigError::InvalidConfiguration`].
pub async fn resolve_setting<T: SettingRow>(
    store: &dyn RecordStore,
    id: SettingId,
) -> RigResult<T> {
    let value = store
        .fetch_setting(T::TABLE, id)
        .await?
        .ok_or(RigError::ConfigurationMissing {
            table: T::TABLE,
            id: id.0,
        })?;
    let row: T = serde_json::from_value(value).map_err(|e| {
        RigError::InvalidConfiguration(format!("{} setting {id}: {e}", T::TABLE))
    })?;
    row.validate()
        .map_err(|msg| RigError::InvalidConfiguration(format!("{} setting {id}: {msg}", T::TABLE)))?;
    Ok(row)
}

/// Validate and upsert a typed settings row.
pub async fn upsert_setting_row<T: SettingRow>(
    store: &dyn RecordStore,
    row: &T,
) -> RigResult<SettingId> {
    row.validate()
        .map_err(|msg| RigError::InvalidConfiguration(format!("{} setting: {msg}", T::TABLE)))?;
    let value = serde_json::to_value(row)?;
    store.upsert_setting(T::TABLE, value).await
}
