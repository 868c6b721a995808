// embed-core/src/runner.rs

//! Drives one partition from enumeration to finalized shard.
//!
//! A runner holds factories rather than components. Every invocation builds
//! a fresh reader, mapper, writer and logger for its partition id, so
//! partitions share no mutable state and can run in any order or in
//! parallel.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{EmbedError, Result};
use crate::inference::Preprocess;
use crate::logger::{BatchTimings, Stats, StatsLogger};
use crate::mapper::Mapper;
use crate::reader::Reader;
use crate::writer::ShardWriter;

pub type ReaderFactory =
    Arc<dyn Fn(u32, Arc<dyn Preprocess>) -> Result<Reader> + Send + Sync>;
pub type MapperFactory = Arc<dyn Fn(u32) -> Result<Mapper> + Send + Sync>;
pub type WriterFactory = Arc<dyn Fn(u32) -> Result<ShardWriter> + Send + Sync>;
pub type LoggerFactory = Arc<dyn Fn(u32) -> StatsLogger + Send + Sync>;

/// Lifecycle of one partition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Processing,
    Finalize,
    Done,
    Failed,
}

impl RunnerState {
    fn can_advance_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (Init, Processing)
                | (Processing, Finalize)
                | (Finalize, Done)
                | (Init | Processing | Finalize, Failed)
        )
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Processing => "processing",
            Self::Finalize => "finalize",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal result of one partition.
#[derive(Debug)]
pub enum PartitionOutcome {
    Done(Stats),
    /// The partition aborted. `stats` holds whatever was counted before.
    Failed { stats: Stats, error: EmbedError },
    /// The partition was never started because the run was cancelled.
    Cancelled { partition_id: u32 },
}

impl PartitionOutcome {
    pub fn partition_id(&self) -> u32 {
        match self {
            Self::Done(stats) | Self::Failed { stats, .. } => stats.partition_id,
            Self::Cancelled { partition_id } => *partition_id,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn stats(&self) -> Option<&Stats> {
        match self {
            Self::Done(stats) | Self::Failed { stats, .. } => Some(stats),
            Self::Cancelled { .. } => None,
        }
    }

    /// Outcome for a partition task that died without reporting.
    pub fn crashed(partition_id: u32, message: impl Into<String>) -> Self {
        let mut stats = Stats::new(partition_id);
        let error = EmbedError::partition_fatal(partition_id, message);
        stats.error = Some(error.to_string());
        Self::Failed { stats, error }
    }
}

/// Per-partition component factories.
#[derive(Clone)]
pub struct Runner {
    /// Number of partitions the factories were built for.
    partition_count: u32,
    reader: ReaderFactory,
    mapper: MapperFactory,
    writer: WriterFactory,
    logger: LoggerFactory,
}

impl Runner {
    pub fn new(
        partition_count: u32,
        reader: ReaderFactory,
        mapper: MapperFactory,
        writer: WriterFactory,
        logger: LoggerFactory,
    ) -> Self {
        Self {
            partition_count,
            reader,
            mapper,
            writer,
            logger,
        }
    }

    /// The partition count shared by the sampler and the shard layout
    /// behind this runner. A run must cover exactly these partitions.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Runs one partition to a terminal state.
    pub fn run(&self, partition_id: u32) -> PartitionOutcome {
        let span = tracing::info_span!("partition", partition_id);
        let _guard = span.enter();

        PartitionRun {
            partition_id,
            state: RunnerState::Init,
            logger: Some((self.logger)(partition_id)),
        }
        .execute(self)
    }
}

struct Components {
    reader: Reader,
    mapper: Mapper,
    writer: ShardWriter,
}

struct PartitionRun {
    partition_id: u32,
    state: RunnerState,
    logger: Option<StatsLogger>,
}

impl PartitionRun {
    fn advance(&mut self, next: RunnerState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {next}",
            self.state
        );
        tracing::debug!(from = %self.state, to = %next, "partition state");
        self.state = next;
    }

    fn execute(mut self, runner: &Runner) -> PartitionOutcome {
        tracing::info!("partition started");

        let mut components = match self.init(runner) {
            Ok(components) => components,
            Err(e) => return self.fail(e, None),
        };

        self.advance(RunnerState::Processing);
        if let Err(e) = self.process(&mut components) {
            return self.fail(e, Some(&components.reader));
        }

        self.advance(RunnerState::Finalize);
        let Components { reader, writer, .. } = components;
        let counters = reader.counters();
        drop(reader);
        if let Some(logger) = self.logger.as_mut() {
            logger.set_item_counts(counters.seen, counters.skipped);
        }

        if let Err(e) = writer.finalize() {
            return self.fail(e, None);
        }

        self.advance(RunnerState::Done);
        let Some(logger) = self.logger.take() else {
            return PartitionOutcome::crashed(self.partition_id, "stats logger already finalized");
        };
        let stats = logger.finish(None);

        tracing::info!(
            embedded = stats.items_embedded,
            skipped = stats.items_skipped,
            batches = stats.batches,
            "partition done"
        );
        PartitionOutcome::Done(stats)
    }

    fn init(&mut self, runner: &Runner) -> Result<Components> {
        let pid = self.partition_id;

        let mut mapper = (runner.mapper)(pid)?;
        let preprocess = mapper.preprocess()?;
        let dimension = mapper.dimension()?;

        let mut writer = (runner.writer)(pid)?;
        writer.set_dimension(dimension);

        let reader = (runner.reader)(pid, preprocess)?;

        Ok(Components {
            reader,
            mapper,
            writer,
        })
    }

    fn process(&mut self, components: &mut Components) -> Result<()> {
        loop {
            let read_start = Instant::now();
            let Some(batch) = components.reader.next_batch()? else {
                return Ok(());
            };
            let batch_index = batch.batch_index;
            let batch_len = batch.len();

            let infer_start = Instant::now();
            let records = components.mapper.apply(batch)?;

            let write_start = Instant::now();
            let embedded = records.len();
            components.writer.write(records)?;
            let write_end = Instant::now();

            let counters = components.reader.counters();
            if let Some(logger) = self.logger.as_mut() {
                logger.record_batch(
                    embedded,
                    BatchTimings {
                        read: infer_start - read_start,
                        inference: write_start - infer_start,
                        write: write_end - write_start,
                    },
                );
                logger.set_item_counts(counters.seen, counters.skipped);
            }

            tracing::debug!(batch_index, items = batch_len, "batch written");
        }
    }

    fn fail(&mut self, error: EmbedError, reader: Option<&Reader>) -> PartitionOutcome {
        self.advance(RunnerState::Failed);
        let error = error.into_partition_fatal(self.partition_id);
        tracing::error!(error = %error, "partition failed");

        let stats = match self.logger.take() {
            Some(mut logger) => {
                if let Some(reader) = reader {
                    let counters = reader.counters();
                    logger.set_item_counts(counters.seen, counters.skipped);
                }
                logger.finish(Some(&error))
            }
            None => Stats::new(self.partition_id),
        };

        PartitionOutcome::Failed { stats, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBackend;
    use crate::testing::{self, FakeCapability, ModelFault};
    use crate::writer::{Modality, ShardLayout};
    use std::path::Path;

    fn runner(
        items: Vec<crate::source::WorkItem>,
        partitions: u32,
        batch_size: usize,
        capability: FakeCapability,
        storage: Arc<dyn StorageBackend>,
    ) -> Runner {
        testing::image_runner(items, partitions, batch_size, capability, storage)
    }

    #[test]
    fn test_partition_done() {
        let (storage, _temp) = testing::temp_storage();
        let runner = runner(
            testing::image_items(7),
            2,
            2,
            FakeCapability::new(4),
            Arc::clone(&storage),
        );

        let outcome = runner.run(0);
        let PartitionOutcome::Done(stats) = outcome else {
            panic!("partition failed: {outcome:?}");
        };
        assert_eq!(stats.items_embedded, 4);
        assert_eq!(stats.items_seen, 4);
        assert_eq!(stats.batches, 2);
        assert!(stats.completed);

        let layout = ShardLayout::new("out", 2).unwrap();
        let images = layout
            .read_embeddings(storage.as_ref(), Modality::Image, 0)
            .unwrap();
        assert_eq!((images.rows, images.cols), (4, 4));
        assert!(storage
            .exists(Path::new("out/stats/stats_0.json"))
            .unwrap());
    }

    #[test]
    fn test_corrupted_item_counted() {
        let (storage, _temp) = testing::temp_storage();
        let items = testing::corrupt(testing::image_items(7), &[3]);
        let runner = runner(items, 2, 2, FakeCapability::new(4), storage);

        let outcome = runner.run(1);
        let stats = outcome.stats().unwrap();
        assert!(outcome.is_done());
        assert_eq!(stats.items_skipped, 1);
        assert_eq!(stats.items_embedded, 2);
        assert_eq!(stats.items_seen, 3);
    }

    #[test]
    fn test_empty_partition_completes() {
        let (storage, _temp) = testing::temp_storage();
        let runner = runner(
            testing::image_items(2),
            4,
            2,
            FakeCapability::new(4),
            Arc::clone(&storage),
        );

        let outcome = runner.run(3);
        assert!(outcome.is_done());
        assert_eq!(outcome.stats().unwrap().batches, 0);

        let layout = ShardLayout::new("out", 4).unwrap();
        assert!(layout.is_complete(storage.as_ref(), 3).unwrap());
        let images = layout
            .read_embeddings(storage.as_ref(), Modality::Image, 3)
            .unwrap();
        assert_eq!((images.rows, images.cols), (0, 4));
    }

    #[test]
    fn test_batch_fatal_fails_partition() {
        let (storage, _temp) = testing::temp_storage();
        let capability = FakeCapability::new(4).with_fault(ModelFault::Error);
        let runner = runner(testing::image_items(7), 2, 2, capability, Arc::clone(&storage));

        let outcome = runner.run(0);
        match &outcome {
            PartitionOutcome::Failed { stats, error } => {
                assert!(matches!(error, EmbedError::BatchFatal { partition_id: 0, .. }));
                assert!(!stats.completed);
                assert_eq!(stats.items_embedded, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let layout = ShardLayout::new("out", 2).unwrap();
        assert!(!layout.is_complete(storage.as_ref(), 0).unwrap());
    }

    #[test]
    fn test_load_failure_fails_in_init() {
        let (storage, _temp) = testing::temp_storage();
        let capability = FakeCapability::new(4).failing_load();
        let runner = runner(testing::image_items(3), 1, 2, capability, storage);

        let outcome = runner.run(0);
        assert!(matches!(
            outcome,
            PartitionOutcome::Failed {
                error: EmbedError::PartitionFatal { partition_id: 0, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_partition_fails() {
        let (storage, _temp) = testing::temp_storage();
        let runner = runner(testing::image_items(3), 2, 2, FakeCapability::new(4), storage);

        let outcome = runner.run(5);
        assert!(!outcome.is_done());
        assert_eq!(outcome.partition_id(), 5);
    }

    #[test]
    fn test_state_transitions() {
        use RunnerState::*;
        assert!(Init.can_advance_to(Processing));
        assert!(Processing.can_advance_to(Failed));
        assert!(Finalize.can_advance_to(Done));
        assert!(!Finalize.can_advance_to(Processing));
        assert!(!Failed.can_advance_to(Processing));
        assert!(!Done.can_advance_to(Failed));
    }
}
