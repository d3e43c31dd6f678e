//! Denoise generation.
//!
//! - [`scheduler`]: flow-matching sigma schedule with dynamic shift
//! - [`noise`]: seeded initial noise
//! - [`guidance`]: classifier-free guidance weights
//! - [`inpaint`]: re-imposing preserved regions
//! - [`denoise`]: the Euler loop
//! - [`pipeline`]: the end-to-end invocation

pub mod denoise;
pub mod guidance;
pub mod inpaint;
pub mod noise;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used items
pub use denoise::{DenoiseInputs, DenoiseLoop, LoopState};
pub use guidance::{apply_cfg, prepare_cfg_scale, CfgScale, DEFAULT_CFG_SCALE};
pub use inpaint::{prepare_inpaint_mask, InpaintExtension};
pub use noise::{get_noise, REFERENCE_CONTEXT};
pub use pipeline::{DenoiseInvocation, InvocationContext, LatentsOutput};
pub use scheduler::{
    calculate_timestep_shift, clip_timestep_schedule_fractional, prepare_timesteps,
    FlowMatchScheduler, FlowMatchSchedulerConfig, TimeShiftType,
};
