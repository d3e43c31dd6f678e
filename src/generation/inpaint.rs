//! Inpainting: re-impose the preserved region after every step.
//!
//! Internally the mask is 1 where the model regenerates and 0 where the
//! initial latents are kept. Masks loaded from the tensor store use the
//! opposite convention and go through [`prepare_inpaint_mask`] first.

use ndarray::{Array2, Array4, ArrayView2, Axis, Zip};

use crate::error::{DenoiseError, Result};

/// Blends intermediate latents with re-noised initial latents.
#[derive(Debug, Clone)]
pub struct InpaintExtension {
    init_latents: Array4<f32>,
    inpaint_mask: Array4<f32>,
    noise: Array4<f32>,
}

impl InpaintExtension {
    /// Creates the extension. All three tensors must share one shape.
    pub fn new(
        init_latents: Array4<f32>,
        inpaint_mask: Array4<f32>,
        noise: Array4<f32>,
    ) -> Result<Self> {
        if inpaint_mask.shape() != init_latents.shape() {
            return Err(DenoiseError::shape_mismatch(
                "inpaint mask",
                init_latents.shape(),
                inpaint_mask.shape(),
            ));
        }
        if noise.shape() != init_latents.shape() {
            return Err(DenoiseError::shape_mismatch(
                "noise",
                init_latents.shape(),
                noise.shape(),
            ));
        }
        Ok(Self {
            init_latents,
            inpaint_mask,
            noise,
        })
    }

    /// Merges `latents` with the initial latents noised to level `t`.
    ///
    /// `noised = t * noise + (1 - t) * init`, then
    /// `latents * mask + noised * (1 - mask)`.
    pub fn merge_intermediate_latents_with_init_latents(
        &self,
        latents: &Array4<f32>,
        t: f32,
    ) -> Result<Array4<f32>> {
        if latents.shape() != self.init_latents.shape() {
            return Err(DenoiseError::shape_mismatch(
                "intermediate latents",
                self.init_latents.shape(),
                latents.shape(),
            ));
        }

        let mut out = latents.clone();
        Zip::from(&mut out)
            .and(&self.inpaint_mask)
            .and(&self.noise)
            .and(&self.init_latents)
            .for_each(|l, &m, &n, &i| {
                let noised = t * n + (1.0 - t) * i;
                *l = *l * m + noised * (1.0 - m);
            });
        Ok(out)
    }
}

/// Converts a stored denoise mask to the internal convention at latent size.
///
/// `denoise_mask` is `[b, c, H, W]` with 1 = preserve; `b` and `c` must each
/// be 1 or match `latents_shape`. The mask is inverted, bilinearly resized to
/// the latent grid and broadcast to `latents_shape`.
pub fn prepare_inpaint_mask(
    denoise_mask: &Array4<f32>,
    latents_shape: [usize; 4],
) -> Result<Array4<f32>> {
    let [batch, channels, out_h, out_w] = latents_shape;
    let mask_shape = denoise_mask.shape();
    let broadcastable = |m: usize, l: usize| m == 1 || m == l;
    if !broadcastable(mask_shape[0], batch) || !broadcastable(mask_shape[1], channels) {
        return Err(DenoiseError::shape_mismatch(
            "denoise mask",
            &[batch, channels, mask_shape[2], mask_shape[3]],
            mask_shape,
        ));
    }
    if mask_shape[2] == 0 || mask_shape[3] == 0 {
        return Err(DenoiseError::shape_mismatch(
            "denoise mask",
            &[mask_shape[0], mask_shape[1], out_h, out_w],
            mask_shape,
        ));
    }

    let mut resized = Array4::<f32>::zeros((mask_shape[0], mask_shape[1], out_h, out_w));
    for (b, src_batch) in denoise_mask.axis_iter(Axis(0)).enumerate() {
        for (c, plane) in src_batch.axis_iter(Axis(0)).enumerate() {
            let inverted = plane.mapv(|v| 1.0 - v);
            let plane_out = resize_bilinear(inverted.view(), out_h, out_w);
            resized
                .index_axis_mut(Axis(0), b)
                .index_axis_mut(Axis(0), c)
                .assign(&plane_out);
        }
    }

    let broadcast = resized
        .broadcast((batch, channels, out_h, out_w))
        .ok_or_else(|| {
            DenoiseError::shape_mismatch("denoise mask", &latents_shape, resized.shape())
        })?
        .to_owned();
    Ok(broadcast)
}

/// Bilinear resize with half-pixel centers and no antialiasing.
fn resize_bilinear(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    let rows: Vec<(usize, usize, f32)> = (0..out_h).map(|i| source_index(i, in_h, out_h)).collect();
    let cols: Vec<(usize, usize, f32)> = (0..out_w).map(|j| source_index(j, in_w, out_w)).collect();

    Array2::from_shape_fn((out_h, out_w), |(i, j)| {
        let (y0, y1, ly) = rows[i];
        let (x0, x1, lx) = cols[j];
        let top = src[[y0, x0]] * (1.0 - lx) + src[[y0, x1]] * lx;
        let bottom = src[[y1, x0]] * (1.0 - lx) + src[[y1, x1]] * lx;
        top * (1.0 - ly) + bottom * ly
    })
}

/// Maps output index `i` to the two source indices and the weight of the second.
fn source_index(i: usize, in_len: usize, out_len: usize) -> (usize, usize, f32) {
    let scale = in_len as f32 / out_len as f32;
    let src = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(in_len - 1);
    let i1 = (i0 + 1).min(in_len - 1);
    let lambda = if i1 == i0 { 0.0 } else { src - i0 as f32 };
    (i0, i1, lambda)
}
