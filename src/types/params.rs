//! Denoise invocation parameters.
//!
//! Mirrors the configuration surface of the denoise node: conditioning
//! handles, guidance, image size, step count, seed and the optional
//! image-to-image / inpainting inputs.

use serde::{Deserialize, Serialize};

use crate::error::{DenoiseError, Result};
use crate::generation::guidance::{CfgScale, DEFAULT_CFG_SCALE};

/// Pixel-to-latent downscale factor of the VAE.
pub const LATENT_SCALE_FACTOR: usize = 8;

/// Width and height must be multiples of this value.
pub const DIMENSION_MULTIPLE: usize = 16;

/// `denoising_start` values above this require initial latents.
const DENOISING_START_EPSILON: f32 = 1e-5;

/// Parameters of one denoise invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseParams {
    /// Conditioning handle for the positive prompt.
    pub positive_conditioning: String,
    /// Conditioning handle for the negative prompt. Enables CFG when present.
    pub negative_conditioning: Option<String>,
    /// Guidance weight, scalar or one per step.
    pub cfg_scale: CfgScale,
    /// Image width in pixels.
    pub width: usize,
    /// Image height in pixels.
    pub height: usize,
    /// Number of denoising steps.
    pub steps: usize,
    /// Noise seed.
    pub seed: u64,
    /// Tensor handle of initial latents for image-to-image.
    pub latents: Option<String>,
    /// Fraction of the schedule to skip at the start.
    pub denoising_start: f32,
    /// Fraction of the schedule at which to stop.
    pub denoising_end: f32,
    /// Tensor handle of the denoise mask (1 = preserve, 0 = regenerate).
    pub denoise_mask: Option<String>,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            positive_conditioning: String::new(),
            negative_conditioning: None,
            cfg_scale: CfgScale::Scalar(DEFAULT_CFG_SCALE),
            width: 1024,
            height: 1024,
            steps: 10,
            seed: 0,
            latents: None,
            denoising_start: 0.0,
            denoising_end: 1.0,
            denoise_mask: None,
        }
    }
}

impl DenoiseParams {
    /// Creates parameters for plain text-to-image generation.
    pub fn new(positive_conditioning: impl Into<String>) -> Self {
        Self {
            positive_conditioning: positive_conditioning.into(),
            ..Default::default()
        }
    }

    /// Returns true when classifier-free guidance will run.
    pub fn do_classifier_free_guidance(&self) -> bool {
        self.negative_conditioning.is_some()
    }

    /// Latent grid size as (height, width).
    pub fn latent_size(&self) -> (usize, usize) {
        (
            self.height / LATENT_SCALE_FACTOR,
            self.width / LATENT_SCALE_FACTOR,
        )
    }

    /// Number of image tokens the transformer sees for a given patch size.
    pub fn image_seq_len(&self, patch_size: usize) -> usize {
        let (h, w) = self.latent_size();
        (h * w) / (patch_size * patch_size).max(1)
    }

    /// Checks every field that can be validated before loading any tensor.
    pub fn validate(&self) -> Result<()> {
        if self.positive_conditioning.is_empty() {
            return Err(DenoiseError::invalid_param(
                "positive_conditioning",
                "conditioning handle is empty",
            ));
        }
        if self.steps == 0 {
            return Err(DenoiseError::invalid_param("steps", "must be > 0"));
        }
        validate_dimension("width", self.width)?;
        validate_dimension("height", self.height)?;
        self.cfg_scale.validate()?;

        if !(0.0..=1.0).contains(&self.denoising_start) {
            return Err(DenoiseError::invalid_param(
                "denoising_start",
                format!("{} is outside [0, 1]", self.denoising_start),
            ));
        }
        if !(0.0..=1.0).contains(&self.denoising_end) {
            return Err(DenoiseError::invalid_param(
                "denoising_end",
                format!("{} is outside [0, 1]", self.denoising_end),
            ));
        }
        if self.denoising_start > self.denoising_end {
            return Err(DenoiseError::invalid_param(
                "denoising_start",
                format!(
                    "{} is greater than denoising_end {}",
                    self.denoising_start, self.denoising_end
                ),
            ));
        }

        if self.latents.is_none() {
            if self.denoising_start > DENOISING_START_EPSILON {
                return Err(DenoiseError::invalid_param(
                    "denoising_start",
                    "must be 0 when initial latents are not provided",
                ));
            }
            if self.denoise_mask.is_some() {
                return Err(DenoiseError::invalid_param(
                    "denoise_mask",
                    "requires initial latents",
                ));
            }
        }

        Ok(())
    }
}

fn validate_dimension(field: &'static str, value: usize) -> Result<()> {
    if value == 0 || value % DIMENSION_MULTIPLE != 0 {
        return Err(DenoiseError::invalid_param(
            field,
            format!("{} is not a positive multiple of {}", value, DIMENSION_MULTIPLE),
        ));
    }
    Ok(())
}
