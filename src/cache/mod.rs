//! Tensor persistence between pipeline stages.

pub mod tensors;

// Re-export commonly used types
pub use tensors::{
    compute_tensor_name, read_f32_tensor, write_f32_tensor, FileTensorStore, InMemoryTensorStore,
    TensorStore,
};
