//! Euler denoising loop.
//!
//! Walks a non-increasing sigma schedule `t_0 >= t_1 >= ... >= t_n`, asking the
//! transformer for a velocity at each `t_curr` and stepping the latents to
//! `t_prev`. Classifier-free guidance doubles the model batch as
//! `[uncond, cond]`; inpainting re-imposes the preserved region after every
//! step.

use ndarray::{concatenate, s, Array1, Array3, Array4, Axis, Zip};
use tracing::debug;

use super::guidance::apply_cfg;
use super::inpaint::InpaintExtension;
use crate::config::Precision;
use crate::error::{DenoiseError, Result};
use crate::models::{BaseModelType, SizeConditioning, Transformer, TransformerInput};
use crate::types::{ProgressSink, StepProgress};

/// Euler is a first-order solver.
const SOLVER_ORDER: usize = 1;

/// Scale between sigmas and the model's timestep input.
const TIMESTEP_SCALE: f32 = 1000.0;

/// Everything the loop needs, prepared by the caller.
#[derive(Debug, Clone)]
pub struct DenoiseInputs {
    /// Clipped, non-increasing sigma schedule (steps + 1 values).
    pub timesteps: Vec<f32>,
    /// One guidance weight per step.
    pub cfg_scale: Vec<f32>,
    /// Seeded noise, `[batch, channels, h, w]`.
    pub noise: Array4<f32>,
    /// Initial latents for image-to-image, same shape as `noise`.
    pub init_latents: Option<Array4<f32>>,
    /// Prepared inpaint mask (1 = regenerate), same shape as `noise`.
    pub inpaint_mask: Option<Array4<f32>>,
    /// Positive prompt embeddings, `[batch, seq, dim]`.
    pub pos_embeds: Array3<f32>,
    /// Negative prompt embeddings. Enables guidance when present.
    pub neg_embeds: Option<Array3<f32>>,
    /// Working precision of latents between steps.
    pub precision: Precision,
    pub size: SizeConditioning,
}

/// Progress of a [`DenoiseLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    /// Holds the number of completed steps.
    Stepping(usize),
    Done,
}

/// A prepared denoising run.
#[derive(Debug)]
pub struct DenoiseLoop {
    timesteps: Vec<f32>,
    cfg_scale: Vec<f32>,
    latents: Array4<f32>,
    /// `[neg; pos]` when guidance is on, else `pos`.
    prompt_embeds: Array3<f32>,
    do_cfg: bool,
    inpaint: Option<InpaintExtension>,
    precision: Precision,
    size: SizeConditioning,
    state: LoopState,
}

impl DenoiseLoop {
    /// Checks the inputs and computes the initial latents.
    pub fn new(inputs: DenoiseInputs) -> Result<Self> {
        let DenoiseInputs {
            timesteps,
            cfg_scale,
            noise,
            init_latents,
            inpaint_mask,
            pos_embeds,
            neg_embeds,
            precision,
            size,
        } = inputs;

        let Some(&t0) = timesteps.first() else {
            return Err(DenoiseError::invalid_param("timesteps", "schedule is empty"));
        };
        if timesteps.windows(2).any(|w| w[1] > w[0]) {
            return Err(DenoiseError::invalid_param(
                "timesteps",
                "schedule must be non-increasing",
            ));
        }
        let total_steps = timesteps.len() - 1;
        if cfg_scale.len() != total_steps {
            return Err(DenoiseError::invalid_param(
                "cfg_scale",
                format!(
                    "{} guidance weights for {} steps",
                    cfg_scale.len(),
                    total_steps
                ),
            ));
        }

        if let Some(init) = &init_latents {
            if init.shape() != noise.shape() {
                return Err(DenoiseError::shape_mismatch(
                    "init latents",
                    noise.shape(),
                    init.shape(),
                ));
            }
        }
        let inpaint = match (inpaint_mask, &init_latents) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(DenoiseError::invalid_param(
                    "denoise_mask",
                    "an inpaint mask requires initial latents",
                ))
            }
            (Some(mask), Some(init)) => Some(InpaintExtension::new(
                init.clone(),
                mask,
                noise.clone(),
            )?),
        };

        let batch = noise.shape()[0];
        if pos_embeds.shape()[0] != batch {
            return Err(DenoiseError::shape_mismatch(
                "positive embeddings batch",
                &[batch],
                &[pos_embeds.shape()[0]],
            ));
        }
        let do_cfg = neg_embeds.is_some();
        let prompt_embeds = match neg_embeds {
            Some(neg) => {
                if neg.shape() != pos_embeds.shape() {
                    return Err(DenoiseError::shape_mismatch(
                        "negative embeddings",
                        pos_embeds.shape(),
                        neg.shape(),
                    ));
                }
                concatenate(Axis(0), &[neg.view(), pos_embeds.view()])?
            }
            None => pos_embeds,
        };

        let mut latents = match &init_latents {
            Some(init) => Zip::from(&noise)
                .and(init)
                .map_collect(|&n, &i| t0 * n + (1.0 - t0) * i),
            None => noise,
        };
        precision.cast_in_place(&mut latents);

        let state = if total_steps == 0 {
            LoopState::Done
        } else {
            LoopState::NotStarted
        };

        Ok(Self {
            timesteps,
            cfg_scale,
            latents,
            prompt_embeds,
            do_cfg,
            inpaint,
            precision,
            size,
            state,
        })
    }

    /// Number of denoising steps in the schedule.
    pub fn total_steps(&self) -> usize {
        self.timesteps.len().saturating_sub(1)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Returns true when guidance doubles the model batch.
    pub fn do_classifier_free_guidance(&self) -> bool {
        self.do_cfg
    }

    /// Current latents.
    pub fn latents(&self) -> &Array4<f32> {
        &self.latents
    }

    pub fn into_latents(self) -> Array4<f32> {
        self.latents
    }

    fn completed_steps(&self) -> usize {
        match self.state {
            LoopState::NotStarted => 0,
            LoopState::Stepping(i) => i,
            LoopState::Done => self.total_steps(),
        }
    }

    fn progress(&self, step: usize, t: f32) -> StepProgress<'_> {
        StepProgress {
            step,
            order: SOLVER_ORDER,
            total_steps: self.total_steps(),
            timestep: (t * TIMESTEP_SCALE) as i64,
            latents: &self.latents,
        }
    }

    /// Runs one Euler step. Does nothing once the loop is done.
    pub fn step<T>(&mut self, transformer: &mut T) -> Result<LoopState>
    where
        T: Transformer + ?Sized,
    {
        if self.state == LoopState::Done {
            return Ok(LoopState::Done);
        }
        let i = self.completed_steps();
        let t_curr = self.timesteps[i];
        let t_prev = self.timesteps[i + 1];

        let model_input = if self.do_cfg {
            concatenate(Axis(0), &[self.latents.view(), self.latents.view()])?
        } else {
            self.latents.clone()
        };
        let timestep = Array1::from_elem(model_input.shape()[0], t_curr * TIMESTEP_SCALE);

        let mut pred = transformer.forward(&TransformerInput {
            hidden_states: &model_input,
            timestep: &timestep,
            encoder_hidden_states: &self.prompt_embeds,
            pooled_projections: None,
            size: &self.size,
        })?;
        if pred.shape() != model_input.shape() {
            return Err(DenoiseError::shape_mismatch(
                "transformer output",
                model_input.shape(),
                pred.shape(),
            ));
        }
        self.precision.cast_in_place(&mut pred);

        if self.do_cfg {
            let half = self.latents.shape()[0];
            let uncond = pred.slice(s![..half, .., .., ..]).to_owned();
            let cond = pred.slice(s![half.., .., .., ..]).to_owned();
            pred = apply_cfg(&uncond, &cond, self.cfg_scale[i]);
            self.precision.cast_in_place(&mut pred);
        }

        let dt = t_prev - t_curr;
        let mut latents = Zip::from(&self.latents)
            .and(&pred)
            .map_collect(|&l, &p| l + dt * p);
        self.precision.cast_in_place(&mut latents);

        if let Some(inpaint) = &self.inpaint {
            latents = inpaint.merge_intermediate_latents_with_init_latents(&latents, t_prev)?;
        }
        self.latents = latents;

        let completed = i + 1;
        self.state = if completed == self.total_steps() {
            LoopState::Done
        } else {
            LoopState::Stepping(completed)
        };
        debug!(
            step = completed,
            total = self.total_steps(),
            t_curr,
            t_prev,
            cfg = self.do_cfg,
            "denoise step"
        );

        Ok(self.state)
    }

    /// Steps to completion, reporting each step to `sink`.
    ///
    /// Emits a `step = 0` snapshot before the first step. A schedule with no
    /// steps returns the initial latents without reporting.
    pub fn run<T, S>(
        mut self,
        transformer: &mut T,
        family: BaseModelType,
        sink: &mut S,
    ) -> Result<Array4<f32>>
    where
        T: Transformer + ?Sized,
        S: ProgressSink + ?Sized,
    {
        if self.state == LoopState::Done {
            return Ok(self.latents);
        }

        sink.on_step(&self.progress(0, self.timesteps[0]), family);
        while self.state != LoopState::Done {
            let i = self.completed_steps();
            let t_curr = self.timesteps[i];
            self.step(transformer)?;
            sink.on_step(&self.progress(i + 1, t_curr), family);
        }

        Ok(self.latents)
    }
}
