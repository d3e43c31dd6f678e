//! cogview4-denoise: flow-matching denoise step for CogView4-style models.
//!
//! Turns seeded Gaussian noise (or noised initial latents) into image latents
//! by repeatedly querying a text-conditioned transformer and taking Euler
//! steps along a resolution-dependent sigma schedule.
//!
//! # Modules
//!
//! - [`generation`]: scheduler, noise, guidance, inpainting, loop and invocation
//! - [`models`]: transformer interface, model registry, conditioning store
//! - [`cache`]: tensor stores for latents and masks
//! - [`types`]: invocation parameters and progress snapshots
//! - [`config`]: runtime configuration (DenoiseConfig, Device, Precision)
//! - [`error`]: error types and codes (DenoiseError, ErrorCode)
//!
//! # Example
//!
//! ```rust,ignore
//! use cogview4_denoise::{
//!     cache::InMemoryTensorStore,
//!     config::ExecutionContext,
//!     generation::{DenoiseInvocation, InvocationContext},
//!     models::{ConditioningData, InMemoryConditioningStore, ModelIdentifier, ModelRegistry},
//!     types::{DenoiseParams, NoProgress},
//! };
//!
//! let mut models = ModelRegistry::new();
//! models.register(ModelIdentifier::cogview4_transformer(), my_transformer);
//!
//! let mut conditioning = InMemoryConditioningStore::new();
//! let positive = conditioning.save(ConditioningData::glm(glm_embeds));
//!
//! let mut tensors = InMemoryTensorStore::new();
//! let mut ctx = InvocationContext {
//!     models: &models,
//!     conditioning: &conditioning,
//!     tensors: &mut tensors,
//!     exec: ExecutionContext::cpu(),
//! };
//!
//! let output = DenoiseInvocation::new(DenoiseParams::new(positive))
//!     .invoke(&mut ctx, &mut NoProgress)?;
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod generation;
pub mod models;
pub mod types;

// Re-export commonly used types at crate root for convenience
pub use config::{DenoiseConfig, Device, ExecutionContext, Precision};
pub use error::{DenoiseError, ErrorCode, Result};
pub use generation::{DenoiseInvocation, InvocationContext, LatentsOutput};
pub use types::DenoiseParams;
