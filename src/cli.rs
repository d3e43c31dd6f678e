//! Command-line interface for inspecting schedules and generating noise.
//!
//! The denoise step itself needs a transformer and conditioning from
//! upstream stages; the CLI exposes the parts that stand alone.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::config::{DenoiseConfig, Precision};
use crate::error::{DenoiseError, Result};
use crate::generation::{
    calculate_timestep_shift, clip_timestep_schedule_fractional, prepare_timesteps,
    FlowMatchScheduler,
};
use crate::types::{DIMENSION_MULTIPLE, LATENT_SCALE_FACTOR};

/// Working precision selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PrecisionArg {
    F32,
    F16,
    Bf16,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::F32 => Precision::F32,
            PrecisionArg::F16 => Precision::F16,
            PrecisionArg::Bf16 => Precision::Bf16,
        }
    }
}

/// cogview4-denoise: flow-matching denoise step for CogView4-style models
#[derive(Parser, Debug)]
#[command(name = "cogview4-denoise")]
#[command(about = "Flow-matching denoise step for CogView4-style text-to-image models")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the resolved timestep schedule for an image size
    Schedule(ScheduleArgs),
    /// Generate seeded latent noise and store it as a tensor
    Noise(NoiseArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ScheduleArgs {
    /// Image width in pixels
    #[arg(long, default_value_t = 1024)]
    pub width: usize,

    /// Image height in pixels
    #[arg(long, default_value_t = 1024)]
    pub height: usize,

    /// Number of denoising steps
    #[arg(long, default_value_t = 10)]
    pub steps: usize,

    /// Transformer patch size
    #[arg(long, default_value_t = 2)]
    pub patch_size: usize,

    /// Fraction of the schedule to skip at the start
    #[arg(long, default_value_t = 0.0)]
    pub denoising_start: f32,

    /// Fraction of the schedule at which to stop
    #[arg(long, default_value_t = 1.0)]
    pub denoising_end: f32,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NoiseArgs {
    /// Image width in pixels
    #[arg(long, default_value_t = 1024)]
    pub width: usize,

    /// Image height in pixels
    #[arg(long, default_value_t = 1024)]
    pub height: usize,

    /// Latent channels
    #[arg(long, default_value_t = 16)]
    pub channels: usize,

    /// Random seed
    #[arg(short, long, default_value_t = 0)]
    pub seed: u64,

    /// Target precision (defaults to the configured precision)
    #[arg(long, value_enum)]
    pub precision: Option<PrecisionArg>,

    /// Tensor store directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

impl NoiseArgs {
    /// Returns the tensor store directory, falling back to the configured one.
    pub fn output_dir(&self, config: &DenoiseConfig) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| config.effective_tensor_path())
    }
}

/// Resolved schedule for one image size.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub image_seq_len: usize,
    pub mu: f32,
    /// Scheduler timesteps (native range).
    pub timesteps: Vec<f32>,
    /// Shifted sigmas including the terminal 0.0.
    pub sigmas: Vec<f32>,
    /// Sigmas walked by the loop after fractional clipping.
    pub clipped: Vec<f32>,
}

impl ScheduleArgs {
    /// Builds the schedule these arguments describe.
    pub fn report(&self) -> Result<ScheduleReport> {
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % DIMENSION_MULTIPLE != 0 {
                return Err(DenoiseError::invalid_param(
                    field,
                    format!("{} is not a positive multiple of {}", value, DIMENSION_MULTIPLE),
                ));
            }
        }
        if self.patch_size == 0 {
            return Err(DenoiseError::invalid_param("patch_size", "must be > 0"));
        }

        let latent_h = self.height / LATENT_SCALE_FACTOR;
        let latent_w = self.width / LATENT_SCALE_FACTOR;
        let image_seq_len = (latent_h * latent_w) / (self.patch_size * self.patch_size);

        let mut scheduler = FlowMatchScheduler::cogview4();
        let config = scheduler.config().clone();
        let mu = calculate_timestep_shift(
            image_seq_len,
            config.base_image_seq_len,
            config.base_shift,
            config.max_shift,
        )?;
        let timesteps = prepare_timesteps(&mut scheduler, self.steps, image_seq_len)?;
        let sigmas = scheduler.sigmas().to_vec();
        let clipped =
            clip_timestep_schedule_fractional(&sigmas, self.denoising_start, self.denoising_end)?;

        Ok(ScheduleReport {
            image_seq_len,
            mu,
            timesteps,
            sigmas,
            clipped,
        })
    }
}
