//! Classifier-free guidance.
//!
//! The guided prediction is `uncond + scale * (cond - uncond)`. A scale of
//! 1.0 reproduces the conditional prediction exactly.

use ndarray::{Array4, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{DenoiseError, Result};

/// Default guidance weight for CogView4.
pub const DEFAULT_CFG_SCALE: f32 = 3.5;

/// Guidance weight, either fixed or one value per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CfgScale {
    Scalar(f32),
    PerStep(Vec<f32>),
}

impl Default for CfgScale {
    fn default() -> Self {
        CfgScale::Scalar(DEFAULT_CFG_SCALE)
    }
}

impl CfgScale {
    /// Rejects non-finite weights.
    ///
    /// List length is checked against the clipped schedule by
    /// [`prepare_cfg_scale`]; an empty list is valid when no steps remain.
    pub fn validate(&self) -> Result<()> {
        match self {
            CfgScale::Scalar(s) if !s.is_finite() => Err(DenoiseError::invalid_param(
                "cfg_scale",
                format!("{} is not finite", s),
            )),
            CfgScale::PerStep(v) if v.iter().any(|s| !s.is_finite()) => Err(
                DenoiseError::invalid_param("cfg_scale", "per-step list holds a non-finite value"),
            ),
            _ => Ok(()),
        }
    }
}

impl From<f32> for CfgScale {
    fn from(scale: f32) -> Self {
        CfgScale::Scalar(scale)
    }
}

impl From<Vec<f32>> for CfgScale {
    fn from(scales: Vec<f32>) -> Self {
        CfgScale::PerStep(scales)
    }
}

/// Expands `cfg_scale` to one weight per step.
///
/// `num_timesteps` is the number of denoising steps in the clipped schedule;
/// a per-step list must match it exactly.
pub fn prepare_cfg_scale(cfg_scale: &CfgScale, num_timesteps: usize) -> Result<Vec<f32>> {
    match cfg_scale {
        CfgScale::Scalar(s) => Ok(vec![*s; num_timesteps]),
        CfgScale::PerStep(v) if v.len() == num_timesteps => Ok(v.clone()),
        CfgScale::PerStep(v) => Err(DenoiseError::invalid_param(
            "cfg_scale",
            format!(
                "per-step list has {} entries, schedule has {} steps",
                v.len(),
                num_timesteps
            ),
        )),
    }
}

/// Combines unconditional and conditional predictions.
pub fn apply_cfg(uncond: &Array4<f32>, cond: &Array4<f32>, scale: f32) -> Array4<f32> {
    if scale == 1.0 {
        return cond.clone();
    }
    Zip::from(uncond)
        .and(cond)
        .map_collect(|&u, &c| u + scale * (c - u))
}
