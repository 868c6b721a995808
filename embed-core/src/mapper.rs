// embed-core/src/mapper.rs

//! Batch inference.
//!
//! The mapper owns one partition's handle on the inference capability. The
//! model is loaded on first use and reused for every batch. A batch either
//! embeds completely or fails as a whole.

use std::sync::Arc;

use crate::config::{Modalities, PipelineConfig};
use crate::error::{CapabilityError, EmbedError, Result};
use crate::inference::{InferenceCapability, LoadOptions, LoadedCapability, Preprocess};
use crate::reader::Batch;

/// One embedded item, tagged with its global index.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub index: u64,
    pub key: String,
    pub image: Option<Vec<f32>>,
    pub text: Option<Vec<f32>>,
    pub caption: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct MapperOptions {
    pub modalities: Modalities,
    pub normalize: bool,
    pub load: LoadOptions,
}

impl MapperOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            modalities: config.inference.modalities(),
            normalize: config.inference.normalize,
            load: LoadOptions::from_config(&config.inference),
        }
    }
}

pub struct Mapper {
    partition_id: u32,
    capability: Arc<dyn InferenceCapability>,
    options: MapperOptions,
    loaded: Option<LoadedCapability>,
}

impl Mapper {
    /// Creates a mapper. Nothing is loaded until the model is first needed.
    pub fn new(
        partition_id: u32,
        capability: Arc<dyn InferenceCapability>,
        options: MapperOptions,
    ) -> Self {
        Self {
            partition_id,
            capability,
            options,
            loaded: None,
        }
    }

    fn loaded(&mut self) -> Result<&LoadedCapability> {
        let loaded = match self.loaded.take() {
            Some(loaded) => loaded,
            None => {
                tracing::debug!(
                    partition_id = self.partition_id,
                    model = %self.options.load.choice,
                    device = ?self.options.load.device,
                    "loading inference capability"
                );
                self.capability
                    .load(&self.options.load)
                    .map_err(|e| EmbedError::inference("failed to load model", e))?
            }
        };
        Ok(self.loaded.insert(loaded))
    }

    /// Preprocessing function matching the loaded model.
    ///
    /// # Errors
    ///
    /// Returns an inference error if the capability cannot be loaded.
    pub fn preprocess(&mut self) -> Result<Arc<dyn Preprocess>> {
        Ok(Arc::clone(&self.loaded()?.preprocess))
    }

    /// Output vector length of the loaded model.
    pub fn dimension(&mut self) -> Result<usize> {
        Ok(self.loaded()?.model.dimension())
    }

    /// Embeds every item of `batch` for each enabled modality.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::BatchFatal`] if the model fails, or returns a
    /// different number of vectors than requested or vectors of the wrong
    /// dimension. No records are produced for a failed batch.
    pub fn apply(&mut self, batch: Batch) -> Result<Vec<EmbeddingRecord>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let partition_id = self.partition_id;
        let batch_index = batch.batch_index;
        let modalities = self.options.modalities;
        let normalize = self.options.normalize;
        let model = Arc::clone(&self.loaded()?.model);
        let dim = model.dimension();

        let fatal = |message: String, source: Option<CapabilityError>| {
            EmbedError::batch_fatal(partition_id, batch_index, message, source)
        };

        let mut images = None;
        if modalities.image {
            let inputs = batch
                .items
                .iter()
                .map(|item| item.image.clone())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| fatal("batch item without image input".to_string(), None))?;
            let vectors = model
                .embed_images(&inputs)
                .map_err(|e| fatal("image inference failed".to_string(), Some(e)))?;
            images = Some(
                check_output(vectors, inputs.len(), dim, "image").map_err(|m| fatal(m, None))?,
            );
        }

        let mut texts = None;
        if modalities.text {
            let inputs = batch
                .items
                .iter()
                .map(|item| item.tokens.clone())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| fatal("batch item without text input".to_string(), None))?;
            let vectors = model
                .embed_texts(&inputs)
                .map_err(|e| fatal("text inference failed".to_string(), Some(e)))?;
            texts = Some(
                check_output(vectors, inputs.len(), dim, "text").map_err(|m| fatal(m, None))?,
            );
        }

        let mut images = images.map(Vec::into_iter);
        let mut texts = texts.map(Vec::into_iter);

        let records = batch
            .items
            .into_iter()
            .map(|item| {
                let mut image = images.as_mut().and_then(Iterator::next);
                let mut text = texts.as_mut().and_then(Iterator::next);
                if normalize {
                    image.iter_mut().chain(text.iter_mut()).for_each(|v| l2_normalize(v));
                }
                EmbeddingRecord {
                    index: item.index,
                    key: item.key,
                    image,
                    text,
                    caption: item.caption,
                    metadata: item.metadata,
                }
            })
            .collect();

        Ok(records)
    }
}

fn check_output(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dim: usize,
    modality: &str,
) -> std::result::Result<Vec<Vec<f32>>, String> {
    if vectors.len() != expected {
        return Err(format!(
            "{modality} model returned {} vectors for {expected} inputs",
            vectors.len()
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
        return Err(format!(
            "{modality} model returned a vector of length {}, expected {dim}",
            bad.len()
        ));
    }
    Ok(vectors)
}

/// Scales `v` to unit length. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}
