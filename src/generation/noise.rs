//! Seeded initial noise.
//!
//! Noise is always drawn in one reference context and then cast to the
//! target precision, so a seed gives the same image on every device.

use ndarray::Array4;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::{Device, ExecutionContext, Precision};
use crate::error::{DenoiseError, Result};
use crate::types::LATENT_SCALE_FACTOR;

/// Context every noise tensor is generated in before casting.
pub const REFERENCE_CONTEXT: ExecutionContext = ExecutionContext {
    device: Device::Cpu,
    precision: Precision::F16,
};

/// Draws `[batch, channels, height / 8, width / 8]` standard normal noise.
///
/// `height` and `width` are in pixels.
pub fn get_noise(
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
    target: &ExecutionContext,
    seed: u64,
) -> Result<Array4<f32>> {
    let latent_h = height / LATENT_SCALE_FACTOR;
    let latent_w = width / LATENT_SCALE_FACTOR;
    if batch == 0 || channels == 0 || latent_h == 0 || latent_w == 0 {
        return Err(DenoiseError::invalid_param(
            "noise_shape",
            format!(
                "empty noise shape [{}, {}, {}, {}]",
                batch, channels, latent_h, latent_w
            ),
        ));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let reference = REFERENCE_CONTEXT.precision;
    let mut noise = Array4::from_shape_fn((batch, channels, latent_h, latent_w), |_| {
        let v: f32 = StandardNormal.sample(&mut rng);
        reference.round(v)
    });
    target.precision.cast_in_place(&mut noise);

    Ok(noise)
}
