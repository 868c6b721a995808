// embed-core/src/lib.rs

//! Partitioned batch embedding pipeline - Core Library
//!
//! This crate splits a collection of items into partitions, runs each
//! partition through batched preprocessing and inference, and persists the
//! resulting vectors as sharded arrays. The model itself is supplied by the
//! caller through the [`inference`] contract.

pub mod config;
pub mod distributor;
pub mod error;
pub mod inference;
pub mod logger;
pub mod mapper;
pub mod npy;
pub mod pipeline;
pub mod reader;
pub mod runner;
pub mod sampler;
pub mod source;
pub mod storage;
pub mod writer;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use config::{ExecutionStrategy, Modalities, PipelineConfig};
pub use distributor::{CancelToken, Distributor, RunReport};
pub use error::{EmbedError, ItemError, Result};
pub use inference::{EmbeddingModel, InferenceCapability, LoadOptions, Preprocess};
pub use logger::{Stats, StatsLogger, StatsSummary};
pub use mapper::{EmbeddingRecord, Mapper};
pub use pipeline::Pipeline;
pub use reader::{Batch, Reader};
pub use runner::{PartitionOutcome, Runner};
pub use sampler::Sampler;
pub use source::{FolderSource, ItemSource, VecSource, WorkItem};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageReader, StorageWriter};
pub use writer::{Modality, ShardLayout, ShardManifest, ShardWriter};
