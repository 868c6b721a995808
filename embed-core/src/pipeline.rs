// embed-core/src/pipeline.rs

//! Configuration-driven assembly of a run.
//!
//! A [`Pipeline`] owns the storage backend and the inference capability and
//! turns a [`PipelineConfig`] into a [`Runner`] and a
//! [`Distributor`](crate::distributor::Distributor) for a
//! given input source.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use embed_core::inference::InferenceCapability;
//! use embed_core::{Pipeline, PipelineConfig};
//!
//! # fn example(capability: Arc<dyn InferenceCapability>) -> embed_core::Result<()> {
//! let config = PipelineConfig::from_file("embed.toml")?.with_env_overrides();
//! let pipeline = Pipeline::from_config(config, capability)?;
//!
//! let report = pipeline.run_folder("images")?;
//! println!("embedded {} items", report.total_embedded());
//! report.into_result()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::distributor::{create_distributor, CancelToken, RunReport};
use crate::error::Result;
use crate::inference::InferenceCapability;
use crate::logger::{StatsLogger, StatsSummary};
use crate::mapper::{Mapper, MapperOptions};
use crate::reader::{Reader, ReaderOptions};
use crate::runner::{LoggerFactory, MapperFactory, ReaderFactory, Runner, WriterFactory};
use crate::sampler::Sampler;
use crate::source::{FolderSource, ItemSource};
use crate::storage::{LocalStorage, StorageBackend};
use crate::writer::{ShardLayout, ShardWriter, WriterOptions};

/// Builds and runs embedding jobs from one configuration.
pub struct Pipeline {
    config: PipelineConfig,
    storage: Arc<dyn StorageBackend>,
    capability: Arc<dyn InferenceCapability>,
    cancel: CancelToken,
}

impl Pipeline {
    /// Creates a pipeline over local storage rooted at `config.storage.base_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the storage
    /// backend cannot be initialized.
    pub fn from_config(
        config: PipelineConfig,
        capability: Arc<dyn InferenceCapability>,
    ) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        Self::with_storage(config, storage, capability)
    }

    /// Loads the configuration from a TOML file, then applies `EMB_`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(
        path: impl AsRef<Path>,
        capability: Arc<dyn InferenceCapability>,
    ) -> Result<Self> {
        let config = PipelineConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config, capability)
    }

    /// Creates a pipeline over an existing storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_storage(
        config: PipelineConfig,
        storage: Arc<dyn StorageBackend>,
        capability: Arc<dyn InferenceCapability>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            capability,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Token that stops runs of this pipeline from starting new partitions.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Output layout for an input of `item_count` items.
    pub fn layout(&self, item_count: u64) -> Result<ShardLayout> {
        let shard_count = self.config.output.resolve_partition_count(item_count);
        ShardLayout::new(&self.config.output.output_folder, shard_count)
    }

    /// Builds the runner for `source` and returns it with the partition
    /// count it expects. Partition `p` writes shard `p`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout or sampler cannot be created.
    pub fn runner(&self, source: Arc<dyn ItemSource>) -> Result<(Runner, u32)> {
        let layout = self.layout(source.len())?;
        let partition_count = layout.shard_count();
        let sampler = Sampler::new(source, partition_count)?;

        let reader_options = ReaderOptions::from_config(&self.config);
        let reader_storage = Arc::clone(&self.storage);
        let reader: ReaderFactory = Arc::new(move |pid, preprocess| {
            Reader::new(
                pid,
                sampler.enumerate(pid)?,
                Arc::clone(&reader_storage),
                preprocess,
                reader_options,
            )
        });

        let mapper_options = MapperOptions::from_config(&self.config);
        let capability = Arc::clone(&self.capability);
        let mapper: MapperFactory = Arc::new(move |pid| {
            Ok(Mapper::new(
                pid,
                Arc::clone(&capability),
                mapper_options.clone(),
            ))
        });

        let writer_options = WriterOptions::from_config(&self.config);
        let writer_storage = Arc::clone(&self.storage);
        let writer: WriterFactory = Arc::new(move |pid| {
            ShardWriter::new(
                pid,
                layout.clone(),
                Arc::clone(&writer_storage),
                writer_options,
            )
        });

        let stats_folder = self.stats_folder();
        let logger_storage = Arc::clone(&self.storage);
        let logger: LoggerFactory = Arc::new(move |pid| {
            StatsLogger::new(pid, Arc::clone(&logger_storage), stats_folder.clone())
        });

        Ok((
            Runner::new(partition_count, reader, mapper, writer, logger),
            partition_count,
        ))
    }

    /// Embeds every item of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot start. Partition failures are
    /// reported through the [`RunReport`].
    pub fn run_source(&self, source: Arc<dyn ItemSource>) -> Result<RunReport> {
        let (runner, partition_count) = self.runner(source)?;
        tracing::info!(
            partitions = partition_count,
            strategy = ?self.config.distributor.strategy,
            output = %self.config.output.output_folder.display(),
            "starting embedding run"
        );

        let distributor = create_distributor(&self.config.distributor, runner, self.cancel.clone())?;
        distributor.run(partition_count)
    }

    /// Embeds every item found under `input_folder`.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be scanned or the run cannot start.
    pub fn run_folder(&self, input_folder: impl Into<PathBuf>) -> Result<RunReport> {
        let source = FolderSource::open(
            self.storage.as_ref(),
            input_folder,
            self.config.inference.modalities(),
        )?;
        self.run_source(Arc::new(source))
    }

    /// Aggregates the stats files written so far.
    pub fn summary(&self) -> Result<StatsSummary> {
        StatsSummary::load(self.storage.as_ref(), &self.stats_folder())
    }

    fn stats_folder(&self) -> PathBuf {
        self.config.output.stats_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionStrategy;
    use crate::error::EmbedError;
    use crate::storage::write_atomic;
    use crate::testing::{self, FakeCapability};
    use crate::writer::Modality;

    fn config(partitions: Option<u32>, batch_size: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.inference.batch_size = batch_size;
        config.inference.num_prepro_workers = 2;
        config.output.output_folder = PathBuf::from("embeddings");
        config.output.output_partition_count = partitions;
        config.output.flush_threshold = 2;
        config
    }

    fn pipeline(config: PipelineConfig, storage: Arc<dyn StorageBackend>) -> Pipeline {
        testing::init_tracing();
        Pipeline::with_storage(config, storage, Arc::new(FakeCapability::new(4))).unwrap()
    }

    fn shard_rows(pipeline: &Pipeline, item_count: u64) -> Vec<u64> {
        let layout = pipeline.layout(item_count).unwrap();
        (0..layout.shard_count())
            .map(|shard| {
                layout
                    .read_manifest(pipeline.storage().as_ref(), shard)
                    .unwrap()
                    .rows
            })
            .collect()
    }

    #[test]
    fn test_seven_items_two_shards() {
        let (storage, _temp) = testing::temp_storage();
        let pipeline = pipeline(config(Some(2), 2), storage);

        let report = pipeline
            .run_source(testing::memory_source(testing::image_items(7)))
            .unwrap();
        assert!(report.is_success());
        assert_eq!(shard_rows(&pipeline, 7), vec![4, 3]);

        let summary = pipeline.summary().unwrap();
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.completed_partitions, 2);
        assert_eq!(summary.items_embedded, 7);
        assert_eq!(summary.items_skipped, 0);
    }

    #[test]
    fn test_corrupted_item_skipped() {
        let (storage, _temp) = testing::temp_storage();
        let pipeline = pipeline(config(Some(2), 2), storage);
        let items = testing::corrupt(testing::image_items(7), &[4]);

        let report = pipeline.run_source(testing::memory_source(items)).unwrap();
        assert!(report.is_success());
        assert_eq!(report.total_embedded(), 6);
        assert_eq!(report.total_skipped(), 1);
        assert_eq!(shard_rows(&pipeline, 7), vec![3, 3]);
    }

    #[test]
    fn test_rerun_into_fresh_folder_is_identical() {
        let (storage, _temp) = testing::temp_storage();
        let items = testing::image_items(11);

        let first = pipeline(config(Some(3), 4), Arc::clone(&storage));
        first
            .run_source(testing::memory_source(items.clone()))
            .unwrap()
            .into_result()
            .unwrap();

        let mut second_config = config(Some(3), 4);
        second_config.output.output_folder = PathBuf::from("embeddings-rerun");
        let second = pipeline(second_config, Arc::clone(&storage));
        second
            .run_source(testing::memory_source(items))
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(shard_rows(&first, 11), shard_rows(&second, 11));
        for shard in 0..3 {
            let a = first
                .layout(11)
                .unwrap()
                .read_embeddings(storage.as_ref(), Modality::Image, shard)
                .unwrap();
            let b = second
                .layout(11)
                .unwrap()
                .read_embeddings(storage.as_ref(), Modality::Image, shard)
                .unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_cluster_strategy_from_config() {
        let (storage, _temp) = testing::temp_storage();
        let mut config = config(Some(3), 2);
        config.distributor.strategy = ExecutionStrategy::Cluster;
        config.distributor.max_concurrent_tasks = 3;
        let pipeline = pipeline(config, storage);

        let report = pipeline
            .run_source(testing::memory_source(testing::image_items(10)))
            .unwrap();
        assert_eq!(report.strategy, ExecutionStrategy::Cluster);
        assert!(report.is_success());
        assert_eq!(shard_rows(&pipeline, 10), vec![4, 3, 3]);
    }

    #[test]
    fn test_text_and_metadata_outputs() {
        let (storage, _temp) = testing::temp_storage();
        let mut config = config(Some(2), 2);
        config.inference.enable_text = true;
        config.inference.enable_metadata = true;
        let pipeline = pipeline(config, Arc::clone(&storage));

        pipeline
            .run_source(testing::memory_source(testing::captioned_items(5)))
            .unwrap()
            .into_result()
            .unwrap();

        let layout = pipeline.layout(5).unwrap();
        let text = layout
            .read_embeddings(storage.as_ref(), Modality::Text, 1)
            .unwrap();
        assert_eq!((text.rows, text.cols), (2, 4));

        let rows = layout.read_metadata(storage.as_ref(), 1).unwrap();
        let indices: Vec<u64> = rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(rows[0].caption.as_deref(), Some("caption 1"));
        assert_eq!(rows[1].metadata, Some(serde_json::json!({ "id": 3 })));

        let manifest = layout.verify(storage.as_ref(), 1).unwrap();
        assert_eq!(manifest.artifacts.len(), 3);
    }

    #[test]
    fn test_run_folder() {
        let (storage, _temp) = testing::temp_storage();
        for i in 0..5 {
            let name = format!("input/part{}/{i:03}.jpg", i % 2);
            write_atomic(storage.as_ref(), Path::new(&name), format!("image-{i}").as_bytes())
                .unwrap();
        }
        // No image for this caption: not enumerated when images are enabled
        write_atomic(storage.as_ref(), Path::new("input/orphan.txt"), b"orphan").unwrap();

        let pipeline = pipeline(config(None, 2), Arc::clone(&storage));
        let report = pipeline.run_folder("input").unwrap();

        assert!(report.is_success());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.total_embedded(), 5);
        assert_eq!(shard_rows(&pipeline, 5), vec![5]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (storage, _temp) = testing::temp_storage();
        let mut config = config(Some(2), 2);
        config.inference.enable_image = false;

        let result = Pipeline::with_storage(config, storage, Arc::new(FakeCapability::new(4)));
        assert!(matches!(result, Err(EmbedError::Config { .. })));
    }

    #[test]
    fn test_cancelled_pipeline_starts_nothing() {
        let (storage, _temp) = testing::temp_storage();
        let pipeline = pipeline(config(Some(2), 2), storage);
        pipeline.cancel_token().cancel();

        let report = pipeline
            .run_source(testing::memory_source(testing::image_items(4)))
            .unwrap();
        assert_eq!(report.cancelled_partitions(), vec![0, 1]);
        assert!(matches!(
            report.into_result(),
            Err(EmbedError::RunFailure { .. })
        ));
    }
}
