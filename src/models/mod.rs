//! Collaborators consumed by the denoise step.
//!
//! - [`Transformer`](transformer::Transformer): the denoising model interface
//! - [`ModelRegistry`](loader::ModelRegistry): lookup and scoped device residency
//! - [`ConditioningStore`](conditioning::ConditioningStore): text embeddings by handle

pub mod conditioning;
pub mod loader;
pub mod transformer;

// Re-export commonly used types
pub use conditioning::{
    load_text_conditioning, ConditioningData, ConditioningInfo, ConditioningStore,
    GlmConditioning, InMemoryConditioningStore, Sd3Conditioning,
};
pub use loader::{
    BaseModelType, ModelHandle, ModelIdentifier, ModelOnDevice, ModelRegistry, ModelType,
    SubModelType,
};
pub use transformer::{SizeConditioning, Transformer, TransformerConfig, TransformerInput};
