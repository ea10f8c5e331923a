//! Trial acquisition: strain stepping, force sampling and photo capture.

pub mod capture;
pub mod decimate;
pub mod runner;
pub mod step;

pub use capture::capture_window;
pub use decimate::{decimate, decimate_files};
pub use runner::{RunOutcome, RunnerState, TrialRunReport, TrialRunner, CALIBRATION_STRAIN};
pub use step::{StepContext, StepController, StepReport};
