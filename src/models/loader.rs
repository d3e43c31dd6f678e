//! Model provider: registry of transformers and scoped device residency.
//!
//! Models are looked up by a `(name, base, type, submodel)` tuple. A
//! [`ModelHandle`] is cheap to clone; the weights behind it are used by one
//! denoising loop at a time through the [`ModelOnDevice`] guard, which moves
//! them back off the device when dropped.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ExecutionContext;
use crate::error::{DenoiseError, Result};

use super::transformer::{Transformer, TransformerConfig};

/// Model family. Also used to tag progress snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseModelType {
    CogView4,
}

impl BaseModelType {
    /// Returns the string representation of the model family.
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseModelType::CogView4 => "cogview4",
        }
    }
}

/// Kind of model record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Main,
}

/// Component of a multi-part main model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubModelType {
    Transformer,
}

/// Logical identifier of a loadable model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentifier {
    pub name: String,
    pub base: BaseModelType,
    pub model_type: ModelType,
    pub submodel: SubModelType,
}

impl ModelIdentifier {
    pub fn new(
        name: impl Into<String>,
        base: BaseModelType,
        model_type: ModelType,
        submodel: SubModelType,
    ) -> Self {
        Self {
            name: name.into(),
            base,
            model_type,
            submodel,
        }
    }

    /// The CogView4 main-model transformer.
    pub fn cogview4_transformer() -> Self {
        Self::new(
            "CogView4",
            BaseModelType::CogView4,
            ModelType::Main,
            SubModelType::Transformer,
        )
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {:?}, {:?})",
            self.name,
            self.base.as_str(),
            self.model_type,
            self.submodel
        )
    }
}

type SharedTransformer = Arc<Mutex<Box<dyn Transformer + Send>>>;

/// Registry of loaded transformers.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<ModelIdentifier, SharedTransformer>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transformer, replacing any previous entry for `id`.
    pub fn register<T>(&mut self, id: ModelIdentifier, model: T)
    where
        T: Transformer + Send + 'static,
    {
        debug!(model = %id, "registering transformer");
        self.models.insert(id, Arc::new(Mutex::new(Box::new(model))));
    }

    /// Looks up a transformer by its attributes.
    pub fn load_by_attrs(
        &self,
        name: &str,
        base: BaseModelType,
        model_type: ModelType,
        submodel: SubModelType,
    ) -> Result<ModelHandle> {
        self.load(&ModelIdentifier::new(name, base, model_type, submodel))
    }

    /// Looks up a transformer by identifier.
    pub fn load(&self, id: &ModelIdentifier) -> Result<ModelHandle> {
        let model = self
            .models
            .get(id)
            .cloned()
            .ok_or_else(|| DenoiseError::model_not_found(id))?;

        let config = model
            .lock()
            .map_err(|_| DenoiseError::model_load_failed(format!("{} lock is poisoned", id)))?
            .config();

        Ok(ModelHandle {
            id: id.clone(),
            config,
            model,
        })
    }

    /// Returns true if a transformer is registered under `id`.
    pub fn contains(&self, id: &ModelIdentifier) -> bool {
        self.models.contains_key(id)
    }

    /// Returns the number of registered transformers.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Shared reference to a registered transformer.
#[derive(Clone)]
pub struct ModelHandle {
    id: ModelIdentifier,
    config: TransformerConfig,
    model: SharedTransformer,
}

impl ModelHandle {
    /// Returns the identifier this handle was loaded with.
    pub fn id(&self) -> &ModelIdentifier {
        &self.id
    }

    /// Returns the transformer's static configuration.
    pub fn config(&self) -> TransformerConfig {
        self.config
    }

    /// Acquires exclusive use of the weights and loads them onto the device.
    ///
    /// Blocks while another loop holds the same weights. The returned guard
    /// offloads the weights when dropped, including on error paths.
    pub fn on_device(&self, ctx: &ExecutionContext) -> Result<ModelOnDevice<'_>> {
        let guard = self.model.lock().map_err(|_| {
            DenoiseError::model_load_failed(format!("{} lock is poisoned", self.id))
        })?;

        let mut on_device = ModelOnDevice {
            id: &self.id,
            guard,
        };
        debug!(model = %self.id, device = %ctx.device, precision = %ctx.precision, "loading weights onto device");
        on_device.guard.load_to_device(ctx)?;
        Ok(on_device)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

/// Transformer resident on the compute device for the guard's lifetime.
pub struct ModelOnDevice<'a> {
    id: &'a ModelIdentifier,
    guard: MutexGuard<'a, Box<dyn Transformer + Send>>,
}

impl Deref for ModelOnDevice<'_> {
    type Target = dyn Transformer + Send;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for ModelOnDevice<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

impl Drop for ModelOnDevice<'_> {
    fn drop(&mut self) {
        debug!(model = %self.id, "offloading weights");
        self.guard.offload();
    }
}
