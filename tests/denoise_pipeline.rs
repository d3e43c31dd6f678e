//! End-to-end tests of the denoise invocation with stub transformers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{Array3, Array4, Zip};

use cogview4_denoise::cache::{FileTensorStore, InMemoryTensorStore, TensorStore};
use cogview4_denoise::config::{Device, ExecutionContext, Precision};
use cogview4_denoise::error::{DenoiseError, ErrorCode, Result};
use cogview4_denoise::generation::{
    clip_timestep_schedule_fractional, get_noise, prepare_timesteps, CfgScale, DenoiseInvocation,
    FlowMatchScheduler, InvocationContext, LatentsOutput,
};
use cogview4_denoise::models::{
    BaseModelType, ConditioningData, InMemoryConditioningStore, ModelIdentifier, ModelRegistry,
    Transformer, TransformerConfig, TransformerInput,
};
use cogview4_denoise::types::{DenoiseParams, NoProgress, StepProgress};

const CHANNELS: usize = 4;

/// Velocity that carries any latent straight to `target` at t = 0.
struct FlowToTarget {
    target: f32,
}

impl Transformer for FlowToTarget {
    fn config(&self) -> TransformerConfig {
        TransformerConfig {
            in_channels: CHANNELS,
            patch_size: 2,
        }
    }

    fn forward(&mut self, input: &TransformerInput<'_>) -> Result<Array4<f32>> {
        let t = input.timestep[0] / 1000.0;
        Ok(input.hidden_states.mapv(|x| (x - self.target) / t))
    }
}

/// Deterministic, input-dependent prediction with distinct uncond/cond halves.
struct Mixing;

impl Transformer for Mixing {
    fn config(&self) -> TransformerConfig {
        TransformerConfig {
            in_channels: CHANNELS,
            patch_size: 2,
        }
    }

    fn forward(&mut self, input: &TransformerInput<'_>) -> Result<Array4<f32>> {
        let t = input.timestep[0] / 1000.0;
        let embeds = input.encoder_hidden_states;
        Ok(Array4::from_shape_fn(
            input.hidden_states.raw_dim(),
            |(b, c, h, w)| {
                let x = input.hidden_states[[b, c, h, w]];
                0.5 * x * t + embeds[[b, 0, 0]] * 0.1 + c as f32 * 0.01
            },
        ))
    }
}

/// Counts device residency and optionally fails in forward.
struct Tracked {
    loads: Arc<AtomicUsize>,
    offloads: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl Transformer for Tracked {
    fn config(&self) -> TransformerConfig {
        TransformerConfig {
            in_channels: CHANNELS,
            patch_size: 2,
        }
    }

    fn forward(&mut self, input: &TransformerInput<'_>) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DenoiseError::model_inference_failed("out of memory"));
        }
        Ok(Array4::zeros(input.hidden_states.raw_dim()))
    }

    fn load_to_device(&mut self, _ctx: &ExecutionContext) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn offload(&mut self) {
        self.offloads.fetch_add(1, Ordering::SeqCst);
    }
}

struct Counters {
    loads: Arc<AtomicUsize>,
    offloads: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

fn tracked(fail: bool) -> (Tracked, Counters) {
    let counters = Counters {
        loads: Arc::new(AtomicUsize::new(0)),
        offloads: Arc::new(AtomicUsize::new(0)),
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let model = Tracked {
        loads: counters.loads.clone(),
        offloads: counters.offloads.clone(),
        calls: counters.calls.clone(),
        fail,
    };
    (model, counters)
}

struct Harness {
    models: ModelRegistry,
    conditioning: InMemoryConditioningStore,
    tensors: InMemoryTensorStore,
    positive: String,
    negative: String,
}

impl Harness {
    fn new<T>(model: T) -> Self
    where
        T: Transformer + Send + 'static,
    {
        let mut models = ModelRegistry::new();
        models.register(ModelIdentifier::cogview4_transformer(), model);

        let mut conditioning = InMemoryConditioningStore::new();
        let positive = conditioning.save(ConditioningData::glm(Array3::from_elem((1, 6, 32), 0.8)));
        let negative =
            conditioning.save(ConditioningData::glm(Array3::from_elem((1, 6, 32), -0.3)));

        Self {
            models,
            conditioning,
            tensors: InMemoryTensorStore::new(),
            positive,
            negative,
        }
    }

    fn params(&self, width: usize, height: usize, steps: usize) -> DenoiseParams {
        DenoiseParams {
            width,
            height,
            steps,
            seed: 42,
            ..DenoiseParams::new(self.positive.clone())
        }
    }

    fn invoke(&mut self, params: DenoiseParams, exec: ExecutionContext) -> Result<LatentsOutput> {
        let mut ctx = InvocationContext {
            models: &self.models,
            conditioning: &self.conditioning,
            tensors: &mut self.tensors,
            exec,
        };
        DenoiseInvocation::new(params).invoke(&mut ctx, &mut NoProgress)
    }

    fn latents(&mut self, output: &LatentsOutput) -> Array4<f32> {
        self.tensors.load(&output.latents_name).unwrap()
    }
}

#[test]
fn flow_reaches_target_at_terminal_sigma() {
    let mut harness = Harness::new(FlowToTarget { target: 0.375 });
    let params = harness.params(128, 64, 6);
    let output = harness.invoke(params, ExecutionContext::cpu()).unwrap();
    let latents = harness.latents(&output);

    assert_eq!(latents.shape(), &[1, CHANNELS, 8, 16]);
    for &v in latents.iter() {
        assert!((v - 0.375).abs() < 1e-4, "latent {} not at target", v);
    }
}

#[test]
fn same_seed_is_deterministic_at_full_size() {
    let run = || {
        let mut harness = Harness::new(Mixing);
        let params = DenoiseParams {
            negative_conditioning: Some(harness.negative.clone()),
            cfg_scale: CfgScale::Scalar(3.5),
            ..harness.params(1024, 1024, 4)
        };
        let output = harness.invoke(params, ExecutionContext::cpu()).unwrap();
        let latents = harness.latents(&output);
        (output, latents)
    };

    let (first_output, first) = run();
    let (second_output, second) = run();
    assert_eq!(first_output, second_output);
    assert_eq!(first, second);
    assert_eq!(first.shape(), &[1, CHANNELS, 128, 128]);
    assert!(first.iter().all(|v| v.is_finite()));

    let pinned: [([usize; 4], f32); 6] = [
        ([0, 0, 0, 0], -0.0028150447),
        ([0, 0, 0, 1], 0.57429564),
        ([0, 0, 0, 2], -0.46725243),
        ([0, 0, 0, 3], -0.0039672563),
        ([0, 2, 64, 31], 0.35186708),
        ([0, 3, 127, 127], 1.3896068),
    ];
    for (index, want) in pinned {
        let got = first[index];
        assert!((got - want).abs() < 1e-5, "latents{:?} = {}, want {}", index, got, want);
    }
    let sum = first.sum();
    assert!((sum + 21808.11).abs() < 0.5, "sum {}", sum);
}

#[test]
fn different_seed_changes_result() {
    let mut harness = Harness::new(Mixing);
    let a = harness.params(64, 64, 3);
    let b = DenoiseParams { seed: 7, ..a.clone() };
    let out_a = harness.invoke(a, ExecutionContext::cpu()).unwrap();
    let out_b = harness.invoke(b, ExecutionContext::cpu()).unwrap();
    assert_ne!(out_a.latents_name, out_b.latents_name);
}

#[test]
fn guidance_scale_one_matches_unguided() {
    let mut harness = Harness::new(Mixing);
    let unguided = harness.params(64, 64, 3);
    let guided = DenoiseParams {
        negative_conditioning: Some(harness.negative.clone()),
        cfg_scale: CfgScale::Scalar(1.0),
        ..unguided.clone()
    };

    let a = harness.invoke(unguided, ExecutionContext::cpu()).unwrap();
    let b = harness.invoke(guided, ExecutionContext::cpu()).unwrap();
    assert_eq!(harness.latents(&a), harness.latents(&b));
}

#[test]
fn half_precision_noise_matches_full_precision_noise() {
    let f32_noise = get_noise(1, CHANNELS, 64, 64, &ExecutionContext::cpu(), 42).unwrap();
    let f16_noise = get_noise(
        1,
        CHANNELS,
        64,
        64,
        &ExecutionContext::new(Device::Cuda, Precision::F16),
        42,
    )
    .unwrap();
    assert_eq!(f32_noise, f16_noise);
}

#[test]
fn weights_are_offloaded_after_failure() {
    let (model, counters) = tracked(true);
    let mut harness = Harness::new(model);
    let params = harness.params(64, 64, 3);

    let err = harness.invoke(params, ExecutionContext::cpu()).unwrap_err();
    assert_eq!(err.code, ErrorCode::ModelInferenceFailed);
    assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
    assert_eq!(counters.offloads.load(Ordering::SeqCst), 1);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn weights_are_offloaded_after_success() {
    let (model, counters) = tracked(false);
    let mut harness = Harness::new(model);
    let params = harness.params(64, 64, 5);

    harness.invoke(params, ExecutionContext::cpu()).unwrap();
    assert_eq!(counters.loads.load(Ordering::SeqCst), 1);
    assert_eq!(counters.offloads.load(Ordering::SeqCst), 1);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 5);
}

#[test]
fn collapsed_schedule_never_touches_the_model() {
    let (model, counters) = tracked(true);
    let mut harness = Harness::new(model);
    let init = Array4::from_elem((1, CHANNELS, 8, 8), 1.5);
    let init_name = harness.tensors.save(&init).unwrap();
    let params = DenoiseParams {
        latents: Some(init_name),
        denoising_start: 1.0,
        denoising_end: 1.0,
        ..harness.params(64, 64, 4)
    };

    let output = harness.invoke(params, ExecutionContext::cpu()).unwrap();
    assert_eq!(harness.latents(&output), init);
    assert_eq!(counters.loads.load(Ordering::SeqCst), 0);
    assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn partial_denoise_reports_clipped_steps() {
    let mut harness = Harness::new(Mixing);
    let init_name = harness
        .tensors
        .save(&Array4::from_elem((1, CHANNELS, 8, 8), 0.2))
        .unwrap();
    let params = DenoiseParams {
        latents: Some(init_name),
        denoising_start: 0.5,
        ..harness.params(64, 64, 10)
    };

    let mut events = Vec::new();
    let mut sink = |p: &StepProgress<'_>, family: BaseModelType| {
        events.push((p.step, p.total_steps, p.timestep, family));
    };
    let mut ctx = InvocationContext {
        models: &harness.models,
        conditioning: &harness.conditioning,
        tensors: &mut harness.tensors,
        exec: ExecutionContext::cpu(),
    };
    DenoiseInvocation::new(params).invoke(&mut ctx, &mut sink).unwrap();

    let total = events[0].1;
    assert!(total > 0 && total < 10, "total {}", total);
    assert_eq!(events.len(), total + 1);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.0, i);
        assert_eq!(event.3, BaseModelType::CogView4);
    }
    // Timesteps never increase and start below the full-noise level.
    assert!(events.windows(2).all(|w| w[1].2 <= w[0].2));
    assert!(events[0].2 < 1000);
}

#[test]
fn regenerate_everything_mask_matches_plain_img2img() {
    let mut harness = Harness::new(Mixing);
    let init_name = harness
        .tensors
        .save(&Array4::from_shape_fn((1, CHANNELS, 8, 8), |(_, c, h, w)| {
            (c + h) as f32 * 0.1 - w as f32 * 0.05
        }))
        .unwrap();
    let mask_name = harness
        .tensors
        .save(&Array4::zeros((1, 1, 64, 64)))
        .unwrap();

    let plain = DenoiseParams {
        latents: Some(init_name),
        denoising_start: 0.3,
        ..harness.params(64, 64, 6)
    };
    let masked = DenoiseParams {
        denoise_mask: Some(mask_name),
        ..plain.clone()
    };

    let a = harness.invoke(plain, ExecutionContext::cpu()).unwrap();
    let b = harness.invoke(masked, ExecutionContext::cpu()).unwrap();
    assert_eq!(harness.latents(&a), harness.latents(&b));
}

#[test]
fn preserve_left_half_mask() {
    let mut harness = Harness::new(Mixing);
    let init = Array4::from_elem((1, CHANNELS, 8, 8), -0.6);
    let init_name = harness.tensors.save(&init).unwrap();
    let mask = Array4::from_shape_fn((1, 1, 64, 64), |(_, _, _, w)| if w < 32 { 1.0 } else { 0.0 });
    let mask_name = harness.tensors.save(&mask).unwrap();

    let params = DenoiseParams {
        latents: Some(init_name),
        denoise_mask: Some(mask_name),
        denoising_start: 0.2,
        ..harness.params(64, 64, 5)
    };
    let output = harness.invoke(params, ExecutionContext::cpu()).unwrap();
    let latents = harness.latents(&output);

    // Left columns sample only preserved pixels, so they equal the init latents.
    let left = latents.slice(ndarray::s![.., .., .., ..3]);
    assert!(left.iter().all(|&v| v == -0.6));
    // Right columns are regenerated.
    let right = latents.slice(ndarray::s![.., .., .., 5..]);
    assert!(right.iter().any(|&v| v != -0.6));
}

#[test]
fn preserve_everything_mask_holds_at_every_step() {
    let mut harness = Harness::new(Mixing);
    let init = Array4::from_shape_fn((1, CHANNELS, 8, 8), |(_, c, h, w)| {
        0.3 - (c * 64 + h * 8 + w) as f32 * 0.01
    });
    let init_name = harness.tensors.save(&init).unwrap();
    let mask_name = harness.tensors.save(&Array4::ones((1, 1, 64, 64))).unwrap();
    let params = DenoiseParams {
        latents: Some(init_name),
        denoise_mask: Some(mask_name),
        denoising_start: 0.2,
        ..harness.params(64, 64, 5)
    };

    let mut scheduler = FlowMatchScheduler::cogview4();
    prepare_timesteps(&mut scheduler, params.steps, params.image_seq_len(2)).unwrap();
    let sigmas =
        clip_timestep_schedule_fractional(scheduler.sigmas(), params.denoising_start, 1.0).unwrap();

    let mut snapshots = Vec::new();
    let mut sink = |p: &StepProgress<'_>, _: BaseModelType| {
        snapshots.push((p.step, p.latents.clone()));
    };
    let mut ctx = InvocationContext {
        models: &harness.models,
        conditioning: &harness.conditioning,
        tensors: &mut harness.tensors,
        exec: ExecutionContext::cpu(),
    };
    DenoiseInvocation::new(params).invoke(&mut ctx, &mut sink).unwrap();

    let noise = get_noise(1, CHANNELS, 64, 64, &ExecutionContext::cpu(), 42).unwrap();
    assert_eq!(snapshots.len(), sigmas.len());
    for (step, latents) in &snapshots {
        let t = sigmas[*step];
        let expected = Zip::from(&noise)
            .and(&init)
            .map_collect(|&n, &i| t * n + (1.0 - t) * i);
        assert_eq!(latents, &expected, "step {} left the re-noised init", step);
    }
    // Intermediate steps sit between noise and init, not at either end.
    let (_, middle) = &snapshots[1];
    assert_ne!(middle, &init);
    assert_ne!(middle, &noise);
}

#[test]
fn file_store_persists_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut models = ModelRegistry::new();
    models.register(ModelIdentifier::cogview4_transformer(), Mixing);
    let mut conditioning = InMemoryConditioningStore::new();
    let positive = conditioning.save(ConditioningData::glm(Array3::from_elem((1, 2, 4), 1.0)));
    let mut tensors = FileTensorStore::open(dir.path()).unwrap();

    let output = {
        let mut ctx = InvocationContext {
            models: &models,
            conditioning: &conditioning,
            tensors: &mut tensors,
            exec: ExecutionContext::cpu(),
        };
        DenoiseInvocation::new(DenoiseParams {
            width: 32,
            height: 32,
            steps: 2,
            ..DenoiseParams::new(positive)
        })
        .invoke(&mut ctx, &mut NoProgress)
        .unwrap()
    };

    assert!(tensors.path_for(&output.latents_name).unwrap().exists());
    let mut reopened = FileTensorStore::open(dir.path()).unwrap();
    let latents = reopened.load(&output.latents_name).unwrap();
    assert_eq!(latents.shape(), &[1, CHANNELS, 4, 4]);
}

#[test]
fn img2img_start_blends_noise_and_init() {
    // A zero-velocity model leaves the initial blend untouched.
    let (model, _) = tracked(false);
    let mut harness = Harness::new(model);
    let init = Array4::from_elem((1, CHANNELS, 8, 8), 2.0);
    let init_name = harness.tensors.save(&init).unwrap();
    let params = DenoiseParams {
        latents: Some(init_name),
        denoising_start: 0.0,
        ..harness.params(64, 64, 3)
    };
    let output = harness.invoke(params, ExecutionContext::cpu()).unwrap();

    // The first sigma is 1.0, so the start is pure noise.
    let noise = get_noise(1, CHANNELS, 64, 64, &ExecutionContext::cpu(), 42).unwrap();
    let expected = Zip::from(&noise)
        .and(&init)
        .map_collect(|&n, &i| 1.0 * n + (1.0 - 1.0) * i);
    assert_eq!(harness.latents(&output), expected);
}
