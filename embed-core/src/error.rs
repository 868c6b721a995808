// embed-core/src/error.rs

use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type reported by the externally supplied inference capability.
pub type CapabilityError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum EmbedError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Item(#[from] ItemError),

    #[error("Batch {batch_index} of partition {partition_id} failed: {message}")]
    BatchFatal {
        partition_id: u32,
        batch_index: u64,
        message: String,
        #[source]
        source: Option<CapabilityError>,
    },

    #[error("Partition {partition_id} failed: {message}")]
    PartitionFatal {
        partition_id: u32,
        message: String,
        #[source]
        source: Option<Box<EmbedError>>,
    },

    #[error("Inference error: {message}")]
    Inference {
        message: String,
        #[source]
        source: Option<CapabilityError>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Partition {partition_id} out of range (total partitions: {partition_count})")]
    InvalidPartition {
        partition_id: u32,
        partition_count: u32,
    },

    #[error("Run incomplete: {} partition(s) did not finish ({})", .failed.len(), PartitionFailure::join(.failed))]
    RunFailure {
        failed: Vec<PartitionFailure>,
    },

    #[error("Run cancelled before the partition started")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EmbedError>;

/// A single item that could not be loaded or preprocessed.
///
/// Item errors are absorbed by the reader: the item is dropped and the
/// partition's skipped counter is incremented.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Item {index} ('{key}') skipped: {reason}")]
pub struct ItemError {
    pub index: u64,
    pub key: String,
    pub reason: String,
}

impl ItemError {
    pub fn new(index: u64, key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Why a partition did not reach Done, as reported in a run failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFailure {
    pub partition_id: u32,
    pub reason: String,
}

impl PartitionFailure {
    fn join(failed: &[PartitionFailure]) -> String {
        failed
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for PartitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {}: {}", self.partition_id, self.reason)
    }
}

// Convenience constructors
impl EmbedError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn batch_fatal(
        partition_id: u32,
        batch_index: u64,
        message: impl Into<String>,
        source: Option<CapabilityError>,
    ) -> Self {
        Self::BatchFatal {
            partition_id,
            batch_index,
            message: message.into(),
            source,
        }
    }

    pub fn partition_fatal(partition_id: u32, message: impl Into<String>) -> Self {
        Self::PartitionFatal {
            partition_id,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an error that aborted a partition. Errors that already are
    /// partition- or batch-fatal pass through unchanged.
    pub fn into_partition_fatal(self, partition_id: u32) -> Self {
        match self {
            Self::PartitionFatal { .. } | Self::BatchFatal { .. } => self,
            other => Self::PartitionFatal {
                partition_id,
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    pub fn inference(message: impl Into<String>, source: CapabilityError) -> Self {
        Self::Inference {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn invalid_partition(partition_id: u32, partition_count: u32) -> Self {
        Self::InvalidPartition {
            partition_id,
            partition_count,
        }
    }

    /// Returns true for errors that abort a partition rather than a single item.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Item(_))
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_partition_fatal_keeps_batch_fatal() {
        let err = EmbedError::batch_fatal(3, 7, "model crashed", None);
        match err.into_partition_fatal(3) {
            EmbedError::BatchFatal {
                partition_id,
                batch_index,
                ..
            } => {
                assert_eq!(partition_id, 3);
                assert_eq!(batch_index, 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_into_partition_fatal_wraps_storage() {
        let err = EmbedError::storage("out/img_emb", "disk full");
        let wrapped = err.into_partition_fatal(1);
        assert!(matches!(wrapped, EmbedError::PartitionFatal { partition_id: 1, .. }));
        assert!(wrapped.to_string().contains("disk full"));
    }

    #[test]
    fn test_run_failure_lists_partitions() {
        let err = EmbedError::RunFailure {
            failed: vec![
                PartitionFailure {
                    partition_id: 0,
                    reason: "boom".to_string(),
                },
                PartitionFailure {
                    partition_id: 4,
                    reason: "cancelled".to_string(),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("2 partition(s)"));
        assert!(message.contains("partition 0: boom"));
        assert!(message.contains("partition 4: cancelled"));
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }

    #[test]
    fn test_item_error_is_not_fatal() {
        let err: EmbedError = ItemError::new(2, "cat", "truncated jpeg").into();
        assert!(!err.is_fatal());
        assert!(EmbedError::Cancelled.is_fatal());
    }
}
