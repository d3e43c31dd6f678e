//! Core types for the denoise step.
//!
//! - [`DenoiseParams`]: the invocation's configuration surface
//! - [`StepProgress`]: per-step snapshot handed to a [`ProgressSink`]

mod params;
mod progress;

pub use params::{DenoiseParams, DIMENSION_MULTIPLE, LATENT_SCALE_FACTOR};
pub use progress::{NoProgress, ProgressSink, StepProgress};
