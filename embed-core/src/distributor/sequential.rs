// embed-core/src/distributor/sequential.rs

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use uuid::Uuid;

use super::{check_partition_count, CancelToken, Distributor, RunReport};
use crate::config::ExecutionStrategy;
use crate::error::{panic_message, Result};
use crate::runner::{PartitionOutcome, Runner};

/// Runs partitions `0..N` one at a time, in order, in the calling thread.
pub struct SequentialDistributor {
    runner: Runner,
    cancel: CancelToken,
}

impl SequentialDistributor {
    pub fn new(runner: Runner, cancel: CancelToken) -> Self {
        Self { runner, cancel }
    }

    /// A panic inside the partition fails that partition only.
    fn run_partition(&self, partition_id: u32) -> PartitionOutcome {
        panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(partition_id))).unwrap_or_else(
            |payload| {
                let message = panic_message(payload);
                tracing::error!(partition_id, panic = %message, "partition task panicked");
                PartitionOutcome::crashed(
                    partition_id,
                    format!("partition task panicked: {message}"),
                )
            },
        )
    }
}

impl Distributor for SequentialDistributor {
    fn run(&self, partition_count: u32) -> Result<RunReport> {
        check_partition_count(&self.runner, partition_count)?;

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id, strategy = "sequential");
        let _guard = span.enter();
        tracing::info!(partitions = partition_count, "run started");

        let start = Instant::now();
        let outcomes = (0..partition_count)
            .map(|partition_id| {
                if self.cancel.is_cancelled() {
                    PartitionOutcome::Cancelled { partition_id }
                } else {
                    self.run_partition(partition_id)
                }
            })
            .collect();

        Ok(RunReport::new(
            run_id,
            ExecutionStrategy::Sequential,
            outcomes,
            start.elapsed(),
        ))
    }

    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Sequential
    }
}
