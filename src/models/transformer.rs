//! Transformer interface consumed by the denoising loop.
//!
//! The architecture itself lives outside this crate; the loop only needs a
//! forward pass that maps noisy latents to a velocity prediction.

use ndarray::{Array1, Array2, Array3, Array4};

use crate::config::ExecutionContext;
use crate::error::Result;

/// Static properties of a loaded transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformerConfig {
    /// Latent channels the model consumes and predicts.
    pub in_channels: usize,
    /// Spatial patch size used to tokenize latents.
    pub patch_size: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        // CogView4-6B
        Self {
            in_channels: 16,
            patch_size: 2,
        }
    }
}

/// Micro-conditioning on the requested image geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeConditioning {
    /// (height, width) of the source image in pixels.
    pub original_size: (f32, f32),
    /// (height, width) of the generated image in pixels.
    pub target_size: (f32, f32),
    /// (top, left) crop offset in pixels.
    pub crop_coords_top_left: (f32, f32),
}

impl SizeConditioning {
    /// Uncropped generation at `height` x `width`.
    pub fn uncropped(height: usize, width: usize) -> Self {
        let size = (height as f32, width as f32);
        Self {
            original_size: size,
            target_size: size,
            crop_coords_top_left: (0.0, 0.0),
        }
    }
}

/// Inputs of one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct TransformerInput<'a> {
    /// Noisy latents, `[batch, channels, h, w]`.
    pub hidden_states: &'a Array4<f32>,
    /// Timestep per batch entry, native scale (0..=1000).
    pub timestep: &'a Array1<f32>,
    /// Text embeddings, `[batch, seq, dim]`.
    pub encoder_hidden_states: &'a Array3<f32>,
    /// Pooled text embeddings, `[batch, dim]`, for models that use them.
    pub pooled_projections: Option<&'a Array2<f32>>,
    pub size: &'a SizeConditioning,
}

/// A denoising transformer.
pub trait Transformer {
    /// Returns the model's static configuration.
    fn config(&self) -> TransformerConfig;

    /// Predicts the flow velocity for `input.hidden_states`.
    ///
    /// The output must have the same shape as the hidden states.
    fn forward(&mut self, input: &TransformerInput<'_>) -> Result<Array4<f32>>;

    /// Moves weights onto the compute device.
    fn load_to_device(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Releases device memory held by the weights.
    fn offload(&mut self) {}
}
