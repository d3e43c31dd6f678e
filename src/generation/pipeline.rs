//! Denoise invocation.
//!
//! Wires the collaborators together: resolves the transformer, loads the
//! text conditioning and optional image-to-image inputs, builds the sigma
//! schedule, runs the loop with the weights on device and stores the result.

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::denoise::{DenoiseInputs, DenoiseLoop, LoopState};
use super::guidance::prepare_cfg_scale;
use super::inpaint::prepare_inpaint_mask;
use super::noise::get_noise;
use super::scheduler::{clip_timestep_schedule_fractional, prepare_timesteps, FlowMatchScheduler};
use crate::cache::TensorStore;
use crate::config::ExecutionContext;
use crate::error::Result;
use crate::models::{
    load_text_conditioning, BaseModelType, ConditioningStore, ModelHandle, ModelRegistry,
    ModelType, SizeConditioning, SubModelType,
};
use crate::types::{DenoiseParams, ProgressSink, LATENT_SCALE_FACTOR};

/// Registry name of the CogView4 main model.
const MODEL_NAME: &str = "CogView4";

/// Collaborators available to an invocation.
pub struct InvocationContext<'a> {
    pub models: &'a ModelRegistry,
    pub conditioning: &'a dyn ConditioningStore,
    pub tensors: &'a mut dyn TensorStore,
    pub exec: ExecutionContext,
}

/// Handle to denoised latents in the tensor store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentsOutput {
    pub latents_name: String,
    /// Pixel width (latent width x 8).
    pub width: usize,
    /// Pixel height (latent height x 8).
    pub height: usize,
    pub seed: u64,
}

/// One text-to-image, image-to-image or inpainting denoise run.
#[derive(Debug, Clone)]
pub struct DenoiseInvocation {
    params: DenoiseParams,
}

impl DenoiseInvocation {
    pub fn new(params: DenoiseParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DenoiseParams {
        &self.params
    }

    /// Runs the denoise step and saves the latents to `ctx.tensors`.
    pub fn invoke<S>(&self, ctx: &mut InvocationContext<'_>, sink: &mut S) -> Result<LatentsOutput>
    where
        S: ProgressSink + ?Sized,
    {
        let latents = self.run_diffusion(ctx, sink)?;
        let latents_name = ctx.tensors.save(&latents)?;

        let shape = latents.shape();
        let output = LatentsOutput {
            latents_name,
            width: shape[3] * LATENT_SCALE_FACTOR,
            height: shape[2] * LATENT_SCALE_FACTOR,
            seed: self.params.seed,
        };
        info!(
            latents = %output.latents_name,
            width = output.width,
            height = output.height,
            seed = output.seed,
            "denoise complete"
        );
        Ok(output)
    }

    /// Runs the denoise step and returns the final latents.
    pub fn run_diffusion<S>(
        &self,
        ctx: &mut InvocationContext<'_>,
        sink: &mut S,
    ) -> Result<Array4<f32>>
    where
        S: ProgressSink + ?Sized,
    {
        let params = &self.params;
        params.validate()?;
        let exec = ctx.exec;

        let transformer = ctx.models.load_by_attrs(
            MODEL_NAME,
            BaseModelType::CogView4,
            ModelType::Main,
            SubModelType::Transformer,
        )?;
        let config = transformer.config();

        let pos_embeds =
            load_text_conditioning(ctx.conditioning, &params.positive_conditioning, exec.precision)?;
        let neg_embeds: Option<Array3<f32>> = params
            .negative_conditioning
            .as_deref()
            .map(|name| load_text_conditioning(ctx.conditioning, name, exec.precision))
            .transpose()?;

        let image_seq_len = params.image_seq_len(config.patch_size);
        let mut scheduler = FlowMatchScheduler::cogview4();
        prepare_timesteps(&mut scheduler, params.steps, image_seq_len)?;
        let timesteps = clip_timestep_schedule_fractional(
            scheduler.sigmas(),
            params.denoising_start,
            params.denoising_end,
        )?;
        let total_steps = timesteps.len() - 1;
        let cfg_scale = prepare_cfg_scale(&params.cfg_scale, total_steps)?;

        info!(
            width = params.width,
            height = params.height,
            steps = total_steps,
            seed = params.seed,
            cfg = params.do_classifier_free_guidance(),
            device = %exec.device,
            precision = %exec.precision,
            "starting denoise"
        );
        debug!(image_seq_len, ?timesteps, "resolved schedule");

        let init_latents = match &params.latents {
            Some(name) => Some(exec.precision.cast(&ctx.tensors.load(name)?)),
            None => None,
        };
        let noise = get_noise(
            1,
            config.in_channels,
            params.height,
            params.width,
            &exec,
            params.seed,
        )?;
        let inpaint_mask = match &params.denoise_mask {
            Some(name) => {
                let mask = ctx.tensors.load(name)?;
                let shape = noise.shape();
                let prepared = prepare_inpaint_mask(&mask, [shape[0], shape[1], shape[2], shape[3]])?;
                Some(exec.precision.cast(&prepared))
            }
            None => None,
        };

        let denoise = DenoiseLoop::new(DenoiseInputs {
            timesteps,
            cfg_scale,
            noise,
            init_latents,
            inpaint_mask,
            pos_embeds,
            neg_embeds,
            precision: exec.precision,
            size: SizeConditioning::uncropped(params.height, params.width),
        })?;

        if denoise.state() == LoopState::Done {
            debug!("no denoising steps in schedule, returning initial latents");
            return Ok(denoise.into_latents());
        }

        run_on_device(&transformer, &exec, denoise, sink)
    }
}

/// Runs `denoise` with the transformer resident on the device.
///
/// The weights are offloaded when this returns, on success and on error.
fn run_on_device<S>(
    transformer: &ModelHandle,
    exec: &ExecutionContext,
    denoise: DenoiseLoop,
    sink: &mut S,
) -> Result<Array4<f32>>
where
    S: ProgressSink + ?Sized,
{
    let mut model = transformer.on_device(exec)?;
    denoise.run(&mut *model, BaseModelType::CogView4, sink)
}
