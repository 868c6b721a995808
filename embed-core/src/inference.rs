// embed-core/src/inference.rs

//! Contract for the externally supplied inference capability.
//!
//! The pipeline never implements a model. It loads one through
//! [`InferenceCapability::load`], hands per-item preprocessing to the reader's
//! workers and whole batches to the model.

use std::fmt;
use std::sync::Arc;

use crate::config::{Device, InferenceConfig};
use crate::error::CapabilityError;

pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

/// Which model the capability should load. Exactly one is active per mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    Primary(String),
    /// Alternate text model (e.g. multilingual). Images still go through
    /// the primary model.
    Alternate { primary: String, alternate: String },
}

impl ModelChoice {
    pub fn from_config(config: &InferenceConfig) -> Self {
        if config.use_alternate_model {
            Self::Alternate {
                primary: config.model.clone(),
                alternate: config.alternate_model.clone(),
            }
        } else {
            Self::Primary(config.model.clone())
        }
    }

    /// Identifier of the model used for text.
    pub fn text_model(&self) -> &str {
        match self {
            Self::Primary(model) => model,
            Self::Alternate { alternate, .. } => alternate,
        }
    }

    pub fn is_alternate(&self) -> bool {
        matches!(self, Self::Alternate { .. })
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary(model) => write!(f, "{model}"),
            Self::Alternate { primary, alternate } => write!(f, "{primary} + {alternate}"),
        }
    }
}

/// Everything the loader needs. The device is passed explicitly; the
/// pipeline never hides accelerators through process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub choice: ModelChoice,
    pub device: Device,
    pub device_index: u32,
}

impl LoadOptions {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            choice: ModelChoice::from_config(config),
            device: config.device,
            device_index: config.device_index,
        }
    }
}

/// Per-item preprocessing, run concurrently by reader workers.
pub trait Preprocess: Send + Sync {
    /// Decodes and transforms raw image bytes into model input.
    fn image(&self, bytes: &[u8]) -> CapabilityResult<Vec<f32>>;

    /// Tokenizes a caption.
    fn text(&self, caption: &str) -> CapabilityResult<Vec<i64>>;
}

/// Batched embedding computation.
pub trait EmbeddingModel: Send + Sync {
    /// Length of every produced vector.
    fn dimension(&self) -> usize;

    fn embed_images(&self, batch: &[Vec<f32>]) -> CapabilityResult<Vec<Vec<f32>>>;

    fn embed_texts(&self, batch: &[Vec<i64>]) -> CapabilityResult<Vec<Vec<f32>>>;
}

/// A loaded model and its matching preprocessing.
#[derive(Clone)]
pub struct LoadedCapability {
    pub model: Arc<dyn EmbeddingModel>,
    pub preprocess: Arc<dyn Preprocess>,
}

/// Loader for the model/preprocess pair.
pub trait InferenceCapability: Send + Sync {
    /// # Errors
    ///
    /// Returns the capability's own error if the model cannot be loaded.
    fn load(&self, options: &LoadOptions) -> CapabilityResult<LoadedCapability>;
}

impl<F> InferenceCapability for F
where
    F: Fn(&LoadOptions) -> CapabilityResult<LoadedCapability> + Send + Sync,
{
    fn load(&self, options: &LoadOptions) -> CapabilityResult<LoadedCapability> {
        self(options)
    }
}
