// embed-core/src/storage/mod.rs

//! Storage abstraction for the embedding pipeline.
//!
//! Every component that touches the filesystem (the folder source, shard
//! writers and the stats logger) goes through [`StorageBackend`], which keeps
//! partitions free of hidden global state and lets tests swap in an
//! in-memory or failing backend.
//!
//! # Example
//!
//! ```no_run
//! use embed_core::config::StorageConfig;
//! use embed_core::storage::{write_atomic, LocalStorage, StorageBackend};
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default()).unwrap();
//! write_atomic(&storage, Path::new("stats/stats_0.json"), b"{}").unwrap();
//! assert!(storage.exists(Path::new("stats/stats_0.json")).unwrap());
//! ```

mod local;
mod traits;

use std::io::Write;
use std::path::{Path, PathBuf};

pub use local::LocalStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};

use crate::error::{EmbedError, Result};

/// Returns the hidden sibling path used while `path` is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Writes `data` to a temporary sibling and renames it over `path`, so a
/// reader either sees the previous object or the complete new one.
pub fn write_atomic(storage: &dyn StorageBackend, path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path);

    let mut writer = storage.open_write(&temp_path)?;
    writer
        .write_all(data)
        .map_err(|e| EmbedError::storage_with_source(&temp_path, "failed to write data", e))?;
    writer.finish()?;

    storage.rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::TempDir;

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let temp = temp_path_for(Path::new("out/img_emb/img_emb_3.npy"));
        assert_eq!(temp, PathBuf::from("out/img_emb/.img_emb_3.npy.tmp"));
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(&StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        write_atomic(&storage, Path::new("stats/stats_1.json"), b"{\"a\":1}").unwrap();

        assert_eq!(storage.list(Path::new("stats")).unwrap(), vec!["stats_1.json"]);
        let mut reader = storage.open_read(Path::new("stats/stats_1.json")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"{\"a\":1}");
    }
}
