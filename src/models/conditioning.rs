//! Conditioning store: text embeddings produced by an upstream encoder stage.

use std::collections::HashMap;

use ndarray::{Array2, Array3};
use sha2::{Digest, Sha256};

use crate::config::Precision;
use crate::error::{DenoiseError, Result};

/// GLM text-encoder output used by CogView4.
#[derive(Debug, Clone, PartialEq)]
pub struct GlmConditioning {
    /// `[1, seq, dim]`
    pub glm_embeds: Array3<f32>,
}

/// CLIP/T5 output used by SD3-style models.
#[derive(Debug, Clone, PartialEq)]
pub struct Sd3Conditioning {
    /// `[1, seq, dim]`
    pub prompt_embeds: Array3<f32>,
    /// `[1, dim]`
    pub pooled_prompt_embeds: Array2<f32>,
}

/// One conditioning record.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditioningInfo {
    Glm(GlmConditioning),
    Sd3(Sd3Conditioning),
}

impl ConditioningInfo {
    fn variant_name(&self) -> &'static str {
        match self {
            ConditioningInfo::Glm(_) => "glm",
            ConditioningInfo::Sd3(_) => "sd3",
        }
    }
}

/// Everything stored under one conditioning handle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditioningData {
    pub conditionings: Vec<ConditioningInfo>,
}

impl ConditioningData {
    /// Wraps a single GLM embedding.
    pub fn glm(glm_embeds: Array3<f32>) -> Self {
        Self {
            conditionings: vec![ConditioningInfo::Glm(GlmConditioning { glm_embeds })],
        }
    }
}

/// Lookup of conditioning records by handle.
pub trait ConditioningStore {
    fn load(&self, name: &str) -> Result<ConditioningData>;
}

/// In-process conditioning store.
#[derive(Debug, Default)]
pub struct InMemoryConditioningStore {
    entries: HashMap<String, ConditioningData>,
}

impl InMemoryConditioningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under a fresh handle and returns the handle.
    pub fn save(&mut self, data: ConditioningData) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.entries.len() as u64).to_le_bytes());
        for info in &data.conditionings {
            hasher.update(info.variant_name().as_bytes());
        }
        let name = format!("cond_{}", hex::encode(&hasher.finalize()[..8]));
        self.entries.insert(name.clone(), data);
        name
    }

    /// Stores `data` under an explicit handle.
    pub fn insert(&mut self, name: impl Into<String>, data: ConditioningData) {
        self.entries.insert(name.into(), data);
    }
}

impl ConditioningStore for InMemoryConditioningStore {
    fn load(&self, name: &str) -> Result<ConditioningData> {
        self.entries.get(name).cloned().ok_or_else(|| {
            DenoiseError::conditioning_mismatch(format!("no conditioning stored as '{}'", name))
        })
    }
}

/// Loads the GLM embeddings stored under `name`, cast to `precision`.
///
/// The record must hold exactly one GLM conditioning.
pub fn load_text_conditioning<S>(store: &S, name: &str, precision: Precision) -> Result<Array3<f32>>
where
    S: ConditioningStore + ?Sized,
{
    let data = store.load(name)?;
    if data.conditionings.len() != 1 {
        return Err(DenoiseError::conditioning_mismatch(format!(
            "'{}' holds {} conditionings, expected 1",
            name,
            data.conditionings.len()
        )));
    }

    match data.conditionings.into_iter().next() {
        Some(ConditioningInfo::Glm(glm)) => Ok(precision.cast(&glm.glm_embeds)),
        Some(other) => Err(DenoiseError::conditioning_mismatch(format!(
            "'{}' is {} conditioning, expected glm",
            name,
            other.variant_name()
        ))),
        None => Err(DenoiseError::conditioning_mismatch(format!("'{}' is empty", name))),
    }
}
