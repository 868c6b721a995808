// embed-core/src/logger.rs

//! Per-partition stats.
//!
//! A [`StatsLogger`] accumulates counters and timings while a partition runs
//! and persists them once, as `stats_<partition>.json`, when the partition
//! reaches a terminal state. Persisting is best effort: a failure is logged
//! and never fails the partition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, Result};
use crate::storage::{write_atomic, StorageBackend};

/// Counters and timings of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub partition_id: u32,
    pub items_seen: u64,
    pub items_embedded: u64,
    pub items_skipped: u64,
    pub batches: u64,
    pub read_duration_secs: f64,
    pub inference_duration_secs: f64,
    pub write_duration_secs: f64,
    pub total_duration_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// True only for partitions that reached Done.
    pub completed: bool,
    pub error: Option<String>,
}

impl Stats {
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            items_seen: 0,
            items_embedded: 0,
            items_skipped: 0,
            batches: 0,
            read_duration_secs: 0.0,
            inference_duration_secs: 0.0,
            write_duration_secs: 0.0,
            total_duration_secs: 0.0,
            started_at: Utc::now(),
            finished_at: None,
            completed: false,
            error: None,
        }
    }
}

/// Time spent in each stage of one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchTimings {
    pub read: Duration,
    pub inference: Duration,
    pub write: Duration,
}

/// Stats sink for one partition.
pub struct StatsLogger {
    storage: Arc<dyn StorageBackend>,
    stats_folder: PathBuf,
    stats: Stats,
    started: Instant,
}

impl StatsLogger {
    pub fn new(
        partition_id: u32,
        storage: Arc<dyn StorageBackend>,
        stats_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            stats_folder: stats_folder.into(),
            stats: Stats::new(partition_id),
            started: Instant::now(),
        }
    }

    /// Location of a partition's stats file.
    pub fn stats_path(stats_folder: &Path, partition_id: u32) -> PathBuf {
        stats_folder.join(format!("stats_{partition_id}.json"))
    }

    pub fn record_batch(&mut self, embedded: usize, timings: BatchTimings) {
        self.stats.batches += 1;
        self.stats.items_embedded += embedded as u64;
        self.stats.read_duration_secs += timings.read.as_secs_f64();
        self.stats.inference_duration_secs += timings.inference.as_secs_f64();
        self.stats.write_duration_secs += timings.write.as_secs_f64();
    }

    /// Updates the reader-side counters.
    pub fn set_item_counts(&mut self, seen: u64, skipped: u64) {
        self.stats.items_seen = seen;
        self.stats.items_skipped = skipped;
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Finalizes and persists the stats. `error` is the reason the partition
    /// failed, if it did.
    pub fn finish(mut self, error: Option<&EmbedError>) -> Stats {
        self.stats.total_duration_secs = self.started.elapsed().as_secs_f64();
        self.stats.finished_at = Some(Utc::now());
        self.stats.completed = error.is_none();
        self.stats.error = error.map(ToString::to_string);

        if let Err(e) = self.persist() {
            tracing::warn!(
                partition_id = self.stats.partition_id,
                error = %e,
                "failed to persist partition stats"
            );
        }

        self.stats
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.stats)
            .map_err(|e| EmbedError::serialization(format!("failed to encode stats: {e}")))?;
        let path = Self::stats_path(&self.stats_folder, self.stats.partition_id);
        write_atomic(self.storage.as_ref(), &path, &bytes)
    }
}

/// Totals over every persisted partition stats file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub partitions: u32,
    pub completed_partitions: u32,
    /// Partitions whose stats record a failure.
    pub failed_partitions: Vec<u32>,
    pub items_seen: u64,
    pub items_embedded: u64,
    pub items_skipped: u64,
    pub batches: u64,
    /// From the earliest start to the latest finish.
    pub wall_time_secs: f64,
    /// Embedded items per second of wall time.
    pub throughput: f64,
}

impl StatsSummary {
    pub fn from_stats(stats: &[Stats]) -> Self {
        let mut summary = Self::default();

        for s in stats {
            summary.partitions += 1;
            if s.completed {
                summary.completed_partitions += 1;
            } else {
                summary.failed_partitions.push(s.partition_id);
            }
            summary.items_seen += s.items_seen;
            summary.items_embedded += s.items_embedded;
            summary.items_skipped += s.items_skipped;
            summary.batches += s.batches;
        }
        summary.failed_partitions.sort_unstable();

        let start = stats.iter().map(|s| s.started_at).min();
        let end = stats.iter().filter_map(|s| s.finished_at).max();
        if let (Some(start), Some(end)) = (start, end) {
            let wall = (end - start).to_std().unwrap_or(Duration::ZERO);
            summary.wall_time_secs = wall.as_secs_f64();
            if summary.wall_time_secs > 0.0 {
                summary.throughput = summary.items_embedded as f64 / summary.wall_time_secs;
            }
        }

        summary
    }

    /// Reads every `stats_*.json` file in `stats_folder`.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be listed or a file is malformed.
    pub fn load(storage: &dyn StorageBackend, stats_folder: &Path) -> Result<Self> {
        let mut stats = Vec::new();

        for name in storage.list(stats_folder)? {
            if !(name.starts_with("stats_") && name.ends_with(".json")) {
                continue;
            }
            let path = stats_folder.join(&name);
            let bytes = storage.open_read(&path)?.read_all()?;
            let parsed: Stats = serde_json::from_slice(&bytes).map_err(|e| {
                EmbedError::serialization(format!("invalid stats file {name}: {e}"))
            })?;
            stats.push(parsed);
        }

        Ok(Self::from_stats(&stats))
    }
}
