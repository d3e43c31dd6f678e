//! Per-step progress snapshots and the sink that receives them.

use ndarray::Array4;

use crate::models::BaseModelType;

/// Snapshot of the denoising loop after a step.
///
/// Borrowed from the loop; sinks that need the latents later must clone them.
#[derive(Debug, Clone, Copy)]
pub struct StepProgress<'a> {
    /// Completed steps (0 before the first step).
    pub step: usize,
    /// Solver order (1 for Euler).
    pub order: usize,
    /// Total number of steps in the clipped schedule.
    pub total_steps: usize,
    /// Current timestep in the solver's native range (0..=1000).
    pub timestep: i64,
    /// Latents after this step.
    pub latents: &'a Array4<f32>,
}

/// Receiver of step snapshots.
///
/// Called synchronously; the loop waits for it before the next step.
pub trait ProgressSink {
    fn on_step(&mut self, progress: &StepProgress<'_>, family: BaseModelType);
}

impl<F> ProgressSink for F
where
    F: FnMut(&StepProgress<'_>, BaseModelType),
{
    fn on_step(&mut self, progress: &StepProgress<'_>, family: BaseModelType) {
        self(progress, family)
    }
}

/// Sink that discards every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_step(&mut self, _progress: &StepProgress<'_>, _family: BaseModelType) {}
}
