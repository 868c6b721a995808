// embed-core/src/config.rs

//! Configuration management for the embedding pipeline.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{EmbedError, Result};

// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inference: InferenceConfig,
    pub reader: ReaderConfig,
    pub output: OutputConfig,
    pub distributor: DistributorConfig,
    pub storage: StorageConfig,
}

/// Compute device handed to the inference capability loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Run inference on the CPU.
    #[default]
    Cpu,
    /// Run inference on an accelerator selected by `device_index`.
    Accelerator,
}

/// Execution strategy for the distributor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// One partition at a time in the calling thread.
    #[default]
    Sequential,
    /// One task per partition submitted to a cluster executor.
    Cluster,
}

impl FromStr for ExecutionStrategy {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "cluster" => Ok(Self::Cluster),
            _ => Err(EmbedError::config(format!(
                "unknown execution strategy: '{s}'. Expected 'sequential' or 'cluster'"
            ))),
        }
    }
}

/// Inference and batching options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Number of items per inference batch.
    pub batch_size: usize,
    /// Number of preprocessing worker threads per partition.
    pub num_prepro_workers: usize,
    pub enable_image: bool,
    pub enable_text: bool,
    pub enable_metadata: bool,
    /// Primary model identifier.
    pub model: String,
    /// Embed text with the alternate (e.g. multilingual) model instead of the primary one.
    pub use_alternate_model: bool,
    /// Alternate text model identifier.
    pub alternate_model: String,
    /// L2-normalize every output vector.
    pub normalize: bool,
    pub device: Device,
    pub device_index: u32,
}

// Reader tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    // Maximum number of items in flight between the feeder and the batch consumer.
    // Zero means "derive from batch_size".
    pub queue_depth: usize,
    // Consecutive item failures tolerated; one more is partition-fatal.
    pub max_consecutive_failures: u32,
}

/// Output layout options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Folder receiving the embedding shards (relative to the storage base path).
    pub output_folder: PathBuf,
    /// Number of output shards. Derived from `write_batch_size` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_partition_count: Option<u32>,
    /// Target number of rows per shard when deriving the shard count.
    pub write_batch_size: u64,
    /// Rows buffered in memory before spilling to the shard's part file.
    pub flush_threshold: usize,
    /// Folder for per-partition stats, relative to `output_folder`.
    pub stats_folder: PathBuf,
}

/// Distributor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    pub strategy: ExecutionStrategy,
    /// Partition tasks the cluster executor runs at once.
    pub max_concurrent_tasks: usize,
    /// Retries the cluster executor grants a failed partition task.
    pub max_task_retries: u32,
    /// Initial delay (milliseconds) before a task retry.
    pub retry_delay_ms: u64,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path for all storage operations.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for reads.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            num_prepro_workers: 8,
            enable_image: true,
            enable_text: false,
            enable_metadata: false,
            model: "ViT-B/32".to_string(),
            use_alternate_model: false,
            alternate_model: String::new(),
            normalize: true,
            device: Device::Cpu,
            device_index: 0,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            queue_depth: 0,
            max_consecutive_failures: 100,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_folder: PathBuf::from("embeddings"),
            output_partition_count: None,
            write_batch_size: 1_000_000,
            flush_threshold: 10_000,
            stats_folder: PathBuf::from("stats"),
        }
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Sequential,
            max_concurrent_tasks: 4,
            max_task_retries: 0,
            retry_delay_ms: 100,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

/// The set of enabled modalities, carried by value through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Modalities {
    pub image: bool,
    pub text: bool,
    pub metadata: bool,
}

impl Modalities {
    /// True if at least one modality is enabled.
    pub fn any(&self) -> bool {
        self.image || self.text || self.metadata
    }
}

impl InferenceConfig {
    pub fn modalities(&self) -> Modalities {
        Modalities {
            image: self.enable_image,
            text: self.enable_text,
            metadata: self.enable_metadata,
        }
    }
}

impl ReaderConfig {
    /// Effective in-flight window for a given batch size.
    pub fn effective_queue_depth(&self, batch_size: usize) -> usize {
        if self.queue_depth == 0 {
            batch_size.saturating_mul(4).max(1)
        } else {
            self.queue_depth
        }
    }
}

impl OutputConfig {
    /// Resolves the shard count, deriving it from `write_batch_size` when not set.
    pub fn resolve_partition_count(&self, item_count: u64) -> u32 {
        match self.output_partition_count {
            Some(count) => count,
            None => {
                let derived = item_count.div_ceil(self.write_batch_size.max(1)).max(1);
                u32::try_from(derived).unwrap_or(u32::MAX)
            }
        }
    }

    /// Stats folder resolved against the output folder.
    pub fn stats_path(&self) -> PathBuf {
        self.output_folder.join(&self.stats_folder)
    }
}

impl FromStr for PipelineConfig {
    type Err = EmbedError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| EmbedError::config_with_source("failed to parse TOML config", e))
    }
}

impl PipelineConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EmbedError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `EMB_` and use underscores
    // to separate nested fields. For example:
    // - `EMB_INFERENCE_BATCH_SIZE` overrides `inference.batch_size`
    // - `EMB_OUTPUT_PARTITION_COUNT` overrides `output.output_partition_count`
    // - `EMB_DISTRIBUTOR_STRATEGY` overrides `distributor.strategy`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Inference overrides
        if let Ok(val) = std::env::var("EMB_INFERENCE_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.inference.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_NUM_PREPRO_WORKERS") {
            if let Ok(v) = val.parse() {
                self.inference.num_prepro_workers = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_ENABLE_IMAGE") {
            if let Ok(v) = val.parse() {
                self.inference.enable_image = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_ENABLE_TEXT") {
            if let Ok(v) = val.parse() {
                self.inference.enable_text = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_ENABLE_METADATA") {
            if let Ok(v) = val.parse() {
                self.inference.enable_metadata = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_MODEL") {
            self.inference.model = val;
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_USE_ALTERNATE_MODEL") {
            if let Ok(v) = val.parse() {
                self.inference.use_alternate_model = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_ALTERNATE_MODEL") {
            self.inference.alternate_model = val;
        }
        if let Ok(val) = std::env::var("EMB_INFERENCE_DEVICE") {
            match val.to_lowercase().as_str() {
                "cpu" => self.inference.device = Device::Cpu,
                "accelerator" => self.inference.device = Device::Accelerator,
                _ => {} // ignore invalid values
            }
        }

        // Reader overrides
        if let Ok(val) = std::env::var("EMB_READER_QUEUE_DEPTH") {
            if let Ok(v) = val.parse() {
                self.reader.queue_depth = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_READER_MAX_CONSECUTIVE_FAILURES") {
            if let Ok(v) = val.parse() {
                self.reader.max_consecutive_failures = v;
            }
        }

        // Output overrides
        if let Ok(val) = std::env::var("EMB_OUTPUT_FOLDER") {
            self.output.output_folder = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("EMB_OUTPUT_PARTITION_COUNT") {
            if let Ok(v) = val.parse() {
                self.output.output_partition_count = Some(v);
            }
        }
        if let Ok(val) = std::env::var("EMB_OUTPUT_WRITE_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.output.write_batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_OUTPUT_FLUSH_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.output.flush_threshold = v;
            }
        }

        // Distributor overrides
        if let Ok(val) = std::env::var("EMB_DISTRIBUTOR_STRATEGY") {
            if let Ok(v) = val.parse() {
                self.distributor.strategy = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_DISTRIBUTOR_MAX_CONCURRENT_TASKS") {
            if let Ok(v) = val.parse() {
                self.distributor.max_concurrent_tasks = v;
            }
        }
        if let Ok(val) = std::env::var("EMB_DISTRIBUTOR_MAX_TASK_RETRIES") {
            if let Ok(v) = val.parse() {
                self.distributor.max_task_retries = v;
            }
        }

        // Storage overrides
        if let Ok(val) = std::env::var("EMB_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("EMB_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        let inference = &self.inference;

        if inference.batch_size == 0 {
            return Err(EmbedError::config(
                "inference.batch_size must be greater than 0",
            ));
        }
        if inference.num_prepro_workers == 0 {
            return Err(EmbedError::config(
                "inference.num_prepro_workers must be greater than 0",
            ));
        }
        if !inference.modalities().any() {
            return Err(EmbedError::config(
                "at least one of inference.enable_image, enable_text or enable_metadata must be true",
            ));
        }
        if inference.use_alternate_model {
            if inference.alternate_model.is_empty() {
                return Err(EmbedError::config(
                    "inference.alternate_model must be set when use_alternate_model is true",
                ));
            }
            if !inference.enable_text {
                return Err(EmbedError::config(
                    "inference.use_alternate_model requires enable_text",
                ));
            }
        } else if inference.model.is_empty() {
            return Err(EmbedError::config("inference.model must not be empty"));
        }

        // Reader validation
        if self.reader.max_consecutive_failures == 0 {
            return Err(EmbedError::config(
                "reader.max_consecutive_failures must be greater than 0",
            ));
        }

        // Output validation
        if self.output.output_partition_count == Some(0) {
            return Err(EmbedError::config(
                "output.output_partition_count must be greater than 0",
            ));
        }
        if self.output.write_batch_size == 0 {
            return Err(EmbedError::config(
                "output.write_batch_size must be greater than 0",
            ));
        }
        if self.output.flush_threshold == 0 {
            return Err(EmbedError::config(
                "output.flush_threshold must be greater than 0",
            ));
        }

        // Distributor validation
        if self.distributor.max_concurrent_tasks == 0 {
            return Err(EmbedError::config(
                "distributor.max_concurrent_tasks must be greater than 0",
            ));
        }

        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(EmbedError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        Ok(())
    }
}
