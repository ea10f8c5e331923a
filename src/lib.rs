//! Core library for the compression rig.
//!
//! Two halves share the record store:
//! - [`acquisition`] drives a trial on the rig: strain steps, force samples
//!   and photo capture, with photos moved into durable storage
//! - [`pipeline`] turns each step's photos into point clouds and meshes and
//!   caches every derived asset by its configuration
//!
//! Hardware, transport, reconstruction tools and storage are trait seams with
//! simulated implementations, so the whole flow runs without a rig.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod transport;
pub mod units;

pub use error::{RigError, RigResult};
