// embed-core/src/sampler.rs

//! Deterministic item-to-partition assignment.
//!
//! Item `i` belongs to partition `i mod N`. The mapping depends only on the
//! global index and the partition count, so re-enumerating a partition after
//! a failure yields the identical sequence of items.

use std::sync::Arc;

use crate::error::{EmbedError, Result};
use crate::source::{ItemSource, WorkItem};

/// Splits a source into `partition_count` disjoint, exhaustive partitions.
#[derive(Clone)]
pub struct Sampler {
    source: Arc<dyn ItemSource>,
    partition_count: u32,
}

impl Sampler {
    /// # Errors
    ///
    /// Returns a configuration error if `partition_count` is zero.
    pub fn new(source: Arc<dyn ItemSource>, partition_count: u32) -> Result<Self> {
        if partition_count == 0 {
            return Err(EmbedError::config("partition count must be greater than 0"));
        }
        Ok(Self {
            source,
            partition_count,
        })
    }

    /// Partition owning `global_index`. `partition_count` must be non-zero.
    pub fn assign(global_index: u64, partition_count: u32) -> u32 {
        (global_index % u64::from(partition_count.max(1))) as u32
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn total_items(&self) -> u64 {
        self.source.len()
    }

    /// Number of items in `partition_id`.
    pub fn partition_len(&self, partition_id: u32) -> u64 {
        let total = self.source.len();
        let id = u64::from(partition_id);
        if id >= total {
            return 0;
        }
        (total - id).div_ceil(u64::from(self.partition_count))
    }

    /// Lazily enumerates the items of one partition in global-index order.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::InvalidPartition`] if `partition_id` is out of range.
    pub fn enumerate(&self, partition_id: u32) -> Result<PartitionItems> {
        if partition_id >= self.partition_count {
            return Err(EmbedError::invalid_partition(
                partition_id,
                self.partition_count,
            ));
        }

        Ok(PartitionItems {
            source: Arc::clone(&self.source),
            next: u64::from(partition_id),
            step: u64::from(self.partition_count),
            total: self.source.len(),
        })
    }
}

/// Iterator over the work items of one partition.
pub struct PartitionItems {
    source: Arc<dyn ItemSource>,
    next: u64,
    step: u64,
    total: u64,
}

impl Iterator for PartitionItems {
    type Item = WorkItem;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let item = self.source.get(self.next);
        self.next = self.next.saturating_add(self.step);
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next >= self.total {
            0
        } else {
            (self.total - self.next).div_ceil(self.step)
        };
        let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}
