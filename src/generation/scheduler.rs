//! Flow-matching Euler discrete scheduler with dynamic shifting.
//!
//! Builds the sigma schedule the denoising loop walks. Sigmas run from ~1.0
//! (pure noise) down to a terminal 0.0; larger images get more high-noise
//! steps through the sequence-length dependent shift `mu`.

use serde::{Deserialize, Serialize};

use crate::error::{DenoiseError, Result};

/// Tolerance used when matching fractional cut points to schedule entries.
const CLIP_EPSILON: f32 = 1e-6;

/// How `mu` bends the sigma curve when dynamic shifting is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeShiftType {
    /// `mu / (mu + (1/t - 1))`
    #[default]
    Linear,
    /// `e^mu / (e^mu + (1/t - 1))`
    Exponential,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowMatchSchedulerConfig {
    pub num_train_timesteps: usize,
    /// Fixed shift, used only when dynamic shifting is off.
    pub shift: f32,
    pub use_dynamic_shifting: bool,
    pub base_shift: f32,
    pub max_shift: f32,
    pub base_image_seq_len: usize,
    pub max_image_seq_len: usize,
    pub time_shift_type: TimeShiftType,
}

impl Default for FlowMatchSchedulerConfig {
    /// CogView4-6B scheduler configuration.
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 1.0,
            use_dynamic_shifting: true,
            base_shift: 0.25,
            max_shift: 0.75,
            base_image_seq_len: 256,
            max_image_seq_len: 4096,
            time_shift_type: TimeShiftType::Linear,
        }
    }
}

/// Flow Matching Euler scheduler.
#[derive(Debug, Clone)]
pub struct FlowMatchScheduler {
    config: FlowMatchSchedulerConfig,
    /// Resolved timesteps, native range (one per step).
    timesteps: Vec<f32>,
    /// Shifted sigmas with a terminal 0.0 (steps + 1 entries).
    sigmas: Vec<f32>,
    sigma_min: f32,
    sigma_max: f32,
}

impl FlowMatchScheduler {
    /// Creates a scheduler with no schedule set.
    pub fn new(config: FlowMatchSchedulerConfig) -> Self {
        let n = config.num_train_timesteps as f32;
        // The training schedule spans t = 1..=N, so sigmas span 1/N..=1.
        let mut sigma_min = 1.0 / n;
        let mut sigma_max = 1.0;
        if !config.use_dynamic_shifting {
            sigma_min = fixed_shift(config.shift, sigma_min);
            sigma_max = fixed_shift(config.shift, sigma_max);
        }

        Self {
            config,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
            sigma_min,
            sigma_max,
        }
    }

    /// Creates a scheduler with the CogView4 configuration.
    pub fn cogview4() -> Self {
        Self::new(FlowMatchSchedulerConfig::default())
    }

    pub fn config(&self) -> &FlowMatchSchedulerConfig {
        &self.config
    }

    /// Returns the resolved timesteps.
    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    /// Returns the resolved sigmas, including the terminal 0.0.
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Returns the number of inference steps of the current schedule.
    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Sets the discrete schedule used by the denoising loop.
    ///
    /// `sigmas` and `timesteps` override the default linear schedule;
    /// `mu` is required when dynamic shifting is enabled.
    pub fn set_timesteps(
        &mut self,
        num_inference_steps: Option<usize>,
        sigmas: Option<&[f32]>,
        mu: Option<f32>,
        timesteps: Option<&[f32]>,
    ) -> Result<()> {
        let mu = match (self.config.use_dynamic_shifting, mu) {
            (true, None) => {
                return Err(DenoiseError::invalid_param(
                    "mu",
                    "must be provided when dynamic shifting is enabled",
                ))
            }
            (_, mu) => mu,
        };

        if let (Some(s), Some(t)) = (sigmas, timesteps) {
            if s.len() != t.len() {
                return Err(DenoiseError::invalid_param(
                    "sigmas",
                    format!("length {} differs from timesteps length {}", s.len(), t.len()),
                ));
            }
        }

        let num_inference_steps = match num_inference_steps {
            Some(n) => {
                if sigmas.is_some_and(|s| s.len() != n) {
                    return Err(DenoiseError::invalid_param(
                        "sigmas",
                        "length must match num_inference_steps",
                    ));
                }
                if timesteps.is_some_and(|t| t.len() != n) {
                    return Err(DenoiseError::invalid_param(
                        "timesteps",
                        "length must match num_inference_steps",
                    ));
                }
                n
            }
            None => sigmas.or(timesteps).map(|v| v.len()).ok_or_else(|| {
                DenoiseError::invalid_param(
                    "num_inference_steps",
                    "required when neither sigmas nor timesteps are given",
                )
            })?,
        };
        if num_inference_steps == 0 {
            return Err(DenoiseError::invalid_param("num_inference_steps", "must be > 0"));
        }

        let train = self.config.num_train_timesteps as f32;
        let provided_timesteps = timesteps.map(|t| t.to_vec());

        let base_sigmas: Vec<f32> = match sigmas {
            Some(s) => s.to_vec(),
            None => {
                let t = match &provided_timesteps {
                    Some(t) => t.clone(),
                    None => linspace(
                        self.sigma_max * train,
                        self.sigma_min * train,
                        num_inference_steps,
                    ),
                };
                t.iter().map(|t| t / train).collect()
            }
        };

        let shifted: Vec<f32> = match mu {
            Some(mu) if self.config.use_dynamic_shifting => base_sigmas
                .iter()
                .map(|&t| time_shift(self.config.time_shift_type, mu, 1.0, t))
                .collect(),
            _ => base_sigmas
                .iter()
                .map(|&s| fixed_shift(self.config.shift, s))
                .collect(),
        };

        self.timesteps = match provided_timesteps {
            Some(t) => t,
            None => shifted.iter().map(|s| s * train).collect(),
        };
        self.sigmas = shifted;
        self.sigmas.push(0.0);

        Ok(())
    }
}

/// Fixed shift: `shift * s / (1 + (shift - 1) * s)`.
fn fixed_shift(shift: f32, s: f32) -> f32 {
    shift * s / (1.0 + (shift - 1.0) * s)
}

/// Dynamic time shift of `t` by `mu`.
fn time_shift(kind: TimeShiftType, mu: f32, sigma: f32, t: f32) -> f32 {
    let base = (1.0 / t - 1.0).powf(sigma);
    match kind {
        TimeShiftType::Linear => mu / (mu + base),
        TimeShiftType::Exponential => {
            let emu = mu.exp();
            emu / (emu + base)
        }
    }
}

/// `steps` evenly spaced values from `start` to `end` inclusive.
///
/// Fills the first half forward from `start` and the second half backward
/// from `end`, so both endpoints are exact in f32.
pub fn linspace(start: f32, end: f32, steps: usize) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (steps - 1) as f32;
            let halfway = steps / 2;
            (0..steps)
                .map(|i| {
                    if i < halfway {
                        start + step * i as f32
                    } else {
                        end - step * (steps - 1 - i) as f32
                    }
                })
                .collect()
        }
    }
}

/// Computes the dynamic shift for an image of `image_seq_len` tokens.
///
/// `mu = sqrt(image_seq_len / base_seq_len) * max_shift + base_shift`
pub fn calculate_timestep_shift(
    image_seq_len: usize,
    base_seq_len: usize,
    base_shift: f32,
    max_shift: f32,
) -> Result<f32> {
    if image_seq_len == 0 {
        return Err(DenoiseError::invalid_param(
            "image_seq_len",
            "must be > 0; check width, height and patch size",
        ));
    }
    if base_seq_len == 0 {
        return Err(DenoiseError::invalid_param("base_image_seq_len", "must be > 0"));
    }
    let m = (image_seq_len as f32 / base_seq_len as f32).sqrt();
    Ok(m * max_shift + base_shift)
}

/// Prepares the scheduler for `num_steps` steps on an image of `image_seq_len` tokens.
///
/// Returns the scheduler's resolved timesteps. The shifted sigmas walked by
/// the loop are available from [`FlowMatchScheduler::sigmas`] afterwards.
pub fn prepare_timesteps(
    scheduler: &mut FlowMatchScheduler,
    num_steps: usize,
    image_seq_len: usize,
) -> Result<Vec<f32>> {
    if num_steps == 0 {
        return Err(DenoiseError::invalid_param("steps", "must be > 0"));
    }

    let train = scheduler.config.num_train_timesteps as f32;
    let timesteps: Vec<f32> = linspace(train, 1.0, num_steps)
        .into_iter()
        .map(|t| t.trunc())
        .collect();
    let sigmas: Vec<f32> = timesteps.iter().map(|t| t / train).collect();

    let mu = calculate_timestep_shift(
        image_seq_len,
        scheduler.config.base_image_seq_len,
        scheduler.config.base_shift,
        scheduler.config.max_shift,
    )?;

    scheduler.set_timesteps(Some(num_steps), Some(&sigmas), Some(mu), Some(&timesteps))?;
    Ok(scheduler.timesteps().to_vec())
}

/// Clips a decreasing schedule to the `[denoising_start, denoising_end]` fraction.
///
/// Cut points are the last entries still at or above `t0 * (1 - fraction)`.
pub fn clip_timestep_schedule_fractional(
    timesteps: &[f32],
    denoising_start: f32,
    denoising_end: f32,
) -> Result<Vec<f32>> {
    if !(0.0..=1.0).contains(&denoising_start) {
        return Err(DenoiseError::invalid_param(
            "denoising_start",
            format!("{} is outside [0, 1]", denoising_start),
        ));
    }
    if !(0.0..=1.0).contains(&denoising_end) {
        return Err(DenoiseError::invalid_param(
            "denoising_end",
            format!("{} is outside [0, 1]", denoising_end),
        ));
    }
    if denoising_start > denoising_end {
        return Err(DenoiseError::invalid_param(
            "denoising_start",
            "must not exceed denoising_end",
        ));
    }
    let Some(&t0) = timesteps.first() else {
        return Err(DenoiseError::invalid_param("timesteps", "schedule is empty"));
    };

    let start_idx = last_index_ge(timesteps, t0 * (1.0 - denoising_start))?;
    let end_idx = last_index_ge(timesteps, t0 * (1.0 - denoising_end))?;
    Ok(timesteps[start_idx..=end_idx].to_vec())
}

fn last_index_ge(timesteps: &[f32], val: f32) -> Result<usize> {
    let count = timesteps
        .iter()
        .filter(|&&t| t >= val - CLIP_EPSILON)
        .count();
    count.checked_sub(1).ok_or_else(|| {
        DenoiseError::invalid_param("timesteps", format!("no entry at or above {}", val))
    })
}
