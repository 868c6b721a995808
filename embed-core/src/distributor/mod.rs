// embed-core/src/distributor/mod.rs

//! Execution strategies for a run.
//!
//! A [`Distributor`] invokes the [`Runner`] once per partition id and
//! aggregates the outcomes into a [`RunReport`]. The sequential variant runs
//! partitions one after another in the calling thread; the cluster variant
//! hands one task per partition to a [`ClusterExecutor`].
//!
//! A run succeeds only if every partition reports Done. Partitions that did
//! complete keep their shards on disk either way.

pub mod cancel;
pub mod cluster;
pub mod retry;
pub mod sequential;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{DistributorConfig, ExecutionStrategy};
use crate::error::{EmbedError, PartitionFailure, Result};
use crate::logger::Stats;
use crate::runner::{PartitionOutcome, Runner};

pub use cancel::CancelToken;
pub use cluster::{ClusterDistributor, ClusterExecutor, LocalClusterExecutor, PartitionJob};
pub use retry::RetryConfig;
pub use sequential::SequentialDistributor;

/// Runs every partition of a run.
pub trait Distributor: Send + Sync {
    /// Runs partitions `0..partition_count` and collects one outcome each.
    ///
    /// # Errors
    ///
    /// Returns a config error when `partition_count` is zero or differs from
    /// [`Runner::partition_count`]. Partition failures are reported through
    /// the [`RunReport`].
    fn run(&self, partition_count: u32) -> Result<RunReport>;

    fn strategy(&self) -> ExecutionStrategy;
}

/// Builds the distributor selected by `config.strategy`.
pub fn create_distributor(
    config: &DistributorConfig,
    runner: Runner,
    cancel: CancelToken,
) -> Result<Box<dyn Distributor>> {
    let distributor: Box<dyn Distributor> = match config.strategy {
        ExecutionStrategy::Sequential => Box::new(SequentialDistributor::new(runner, cancel)),
        ExecutionStrategy::Cluster => Box::new(ClusterDistributor::new(
            runner,
            Arc::new(LocalClusterExecutor::from_config(config)),
            cancel,
        )?),
    };
    Ok(distributor)
}

/// A run covers exactly the partitions the runner's sampler and shard
/// layout were built for.
fn check_partition_count(runner: &Runner, partition_count: u32) -> Result<()> {
    if partition_count == 0 {
        return Err(EmbedError::config("partition count must be greater than 0"));
    }
    if partition_count != runner.partition_count() {
        return Err(EmbedError::config(format!(
            "run requested {partition_count} partitions but the runner was built for {}",
            runner.partition_count()
        )));
    }
    Ok(())
}

/// Aggregate result of one run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub strategy: ExecutionStrategy,
    /// One outcome per partition, ordered by partition id.
    pub outcomes: Vec<PartitionOutcome>,
    pub elapsed: Duration,
}

impl RunReport {
    pub(crate) fn new(
        run_id: Uuid,
        strategy: ExecutionStrategy,
        mut outcomes: Vec<PartitionOutcome>,
        elapsed: Duration,
    ) -> Self {
        outcomes.sort_by_key(PartitionOutcome::partition_id);
        let report = Self {
            run_id,
            strategy,
            outcomes,
            elapsed,
        };

        tracing::info!(
            run_id = %report.run_id,
            partitions = report.outcomes.len(),
            failed = ?report.failed_partitions(),
            cancelled = ?report.cancelled_partitions(),
            embedded = report.total_embedded(),
            skipped = report.total_skipped(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            "run finished"
        );
        report
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(PartitionOutcome::is_done)
    }

    pub fn failed_partitions(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, PartitionOutcome::Failed { .. }))
            .map(PartitionOutcome::partition_id)
            .collect()
    }

    pub fn cancelled_partitions(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, PartitionOutcome::Cancelled { .. }))
            .map(PartitionOutcome::partition_id)
            .collect()
    }

    pub fn total_embedded(&self) -> u64 {
        self.stats().map(|s| s.items_embedded).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.stats().map(|s| s.items_skipped).sum()
    }

    fn stats(&self) -> impl Iterator<Item = &Stats> {
        self.outcomes.iter().filter_map(PartitionOutcome::stats)
    }

    /// Returns the stats of every partition, or [`EmbedError::RunFailure`]
    /// listing each partition that did not reach Done.
    pub fn into_result(self) -> Result<Vec<Stats>> {
        let mut done = Vec::with_capacity(self.outcomes.len());
        let mut failed = Vec::new();

        for outcome in self.outcomes {
            match outcome {
                PartitionOutcome::Done(stats) => done.push(stats),
                PartitionOutcome::Failed { stats, error } => failed.push(PartitionFailure {
                    partition_id: stats.partition_id,
                    reason: error.to_string(),
                }),
                PartitionOutcome::Cancelled { partition_id } => failed.push(PartitionFailure {
                    partition_id,
                    reason: EmbedError::Cancelled.to_string(),
                }),
            }
        }

        if failed.is_empty() {
            Ok(done)
        } else {
            Err(EmbedError::RunFailure { failed })
        }
    }
}
