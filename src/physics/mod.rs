//! Surface-process physics: configuration, clock and the per-step engine.

pub mod clock;
pub mod config;
pub mod surface;

pub use config::{SurfaceConfig, ValidatedConfig};
pub use surface::{Phase, StepReport, SurfaceProcessEngine};
