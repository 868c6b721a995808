// embed-core/src/distributor/cluster.rs

//! Cluster-distributed execution.
//!
//! The distributor submits one independent task per partition id to a
//! [`ClusterExecutor`] and collects one outcome per task. Placement,
//! parallelism and retries belong to the executor. [`LocalClusterExecutor`]
//! places tasks on the blocking pool of a tokio runtime, bounded by a
//! semaphore.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::retry::{retry_async, RetryConfig};
use super::{check_partition_count, CancelToken, Distributor, RunReport};
use crate::config::{DistributorConfig, ExecutionStrategy};
use crate::error::{panic_message, EmbedError, Result};
use crate::runner::{PartitionOutcome, Runner};

/// One partition task. Must be safe to invoke again for the same id.
pub type PartitionJob = Arc<dyn Fn(u32) -> PartitionOutcome + Send + Sync>;

/// Compute layer that runs partition tasks.
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    /// Runs `job` once per partition id and returns one outcome per id.
    ///
    /// Ids not yet started when `cancel` fires are reported as
    /// [`PartitionOutcome::Cancelled`].
    async fn execute(
        &self,
        partition_ids: Vec<u32>,
        job: PartitionJob,
        cancel: CancelToken,
    ) -> Vec<PartitionOutcome>;
}

/// Runs partition tasks on the local blocking thread pool.
#[derive(Debug, Clone)]
pub struct LocalClusterExecutor {
    max_concurrent: usize,
    retry: RetryConfig,
}

impl LocalClusterExecutor {
    pub fn new(max_concurrent: usize, retry: RetryConfig) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            retry,
        }
    }

    pub fn from_config(config: &DistributorConfig) -> Self {
        Self::new(config.max_concurrent_tasks, RetryConfig::from(config))
    }
}

#[async_trait]
impl ClusterExecutor for LocalClusterExecutor {
    async fn execute(
        &self,
        partition_ids: Vec<u32>,
        job: PartitionJob,
        cancel: CancelToken,
    ) -> Vec<PartitionOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<u32> = partition_ids.iter().copied().collect();

        for partition_id in partition_ids {
            let semaphore = Arc::clone(&semaphore);
            let job = Arc::clone(&job);
            let cancel = cancel.clone();
            let retry = self.retry.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return PartitionOutcome::Cancelled { partition_id },
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return PartitionOutcome::Cancelled { partition_id },
                    },
                };

                retry_async(&retry, &cancel, PartitionOutcome::is_done, |attempt| {
                    let job = Arc::clone(&job);
                    async move {
                        if attempt > 0 {
                            tracing::warn!(partition_id, attempt, "retrying partition task");
                        }
                        run_task(job, partition_id).await
                    }
                })
                .await
            });
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending.remove(&outcome.partition_id());
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!(error = %e, "partition task lost"),
            }
        }
        // Tasks that vanished without reporting still get an outcome
        outcomes.extend(
            pending
                .into_iter()
                .map(|id| PartitionOutcome::crashed(id, "partition task lost")),
        );

        outcomes.sort_by_key(PartitionOutcome::partition_id);
        outcomes
    }
}

/// Runs one attempt of a partition task on the blocking pool.
async fn run_task(job: PartitionJob, partition_id: u32) -> PartitionOutcome {
    match tokio::task::spawn_blocking(move || job(partition_id)).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::error!(partition_id, panic = %message, "partition task panicked");
            PartitionOutcome::crashed(partition_id, format!("partition task panicked: {message}"))
        }
        Err(e) => PartitionOutcome::crashed(partition_id, format!("partition task aborted: {e}")),
    }
}

/// Submits one task per partition to a [`ClusterExecutor`].
///
/// Owns the tokio runtime the executor runs on, so [`Distributor::run`]
/// must not be called from inside another tokio runtime.
pub struct ClusterDistributor {
    runner: Runner,
    executor: Arc<dyn ClusterExecutor>,
    cancel: CancelToken,
    runtime: Runtime,
}

impl ClusterDistributor {
    /// # Errors
    ///
    /// Returns an error if the tokio runtime cannot be built.
    pub fn new(
        runner: Runner,
        executor: Arc<dyn ClusterExecutor>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("embed-cluster")
            .enable_all()
            .build()
            .map_err(|e| EmbedError::config_with_source("failed to build cluster runtime", e))?;

        Ok(Self {
            runner,
            executor,
            cancel,
            runtime,
        })
    }
}

impl Distributor for ClusterDistributor {
    fn run(&self, partition_count: u32) -> Result<RunReport> {
        check_partition_count(&self.runner, partition_count)?;

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id, strategy = "cluster");
        let _guard = span.enter();
        tracing::info!(partitions = partition_count, "run started");

        let runner = self.runner.clone();
        let job: PartitionJob = Arc::new(move |partition_id| runner.run(partition_id));

        let start = Instant::now();
        let outcomes = self.runtime.block_on(self.executor.execute(
            (0..partition_count).collect(),
            job,
            self.cancel.clone(),
        ));

        Ok(RunReport::new(
            run_id,
            ExecutionStrategy::Cluster,
            outcomes,
            start.elapsed(),
        ))
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Cluster
    }
}
