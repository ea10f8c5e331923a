//! Derived-asset pipeline: point clouds and meshes built from a step's frames.
//!
//! Stages run in order and are cached per `(step, key)`; see [`stages`] for
//! the stage contract and [`orchestrator`] for whole-trial processing.

pub mod colors;
pub mod crop;
pub mod mesh;
pub mod mock;
pub mod orchestrator;
pub mod stages;
pub mod tools;

pub use colors::determine_plane_colors;
pub use mock::MockTools;
pub use orchestrator::{process_trial, process_trials, StageStop, StepProcessing, TrialProcessingReport};
pub use stages::{AssetPipeline, PipelineConfig, Stage, StageOutcome};
pub use tools::{CommandTools, ReconstructionTools};
