// embed-core/src/storage/traits.rs

//! Storage abstraction traits used by the pipeline.
//!
//! Shard writers, the stats logger and the folder source all go through
//! these traits, so a different backend can be swapped in without touching
//! the pipeline components.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::Result;

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time, if available.
    pub modified: Option<std::time::SystemTime>,
    /// Whether this object is a directory.
    pub is_dir: bool,
}

/// A handle for reading from storage.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads `length` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;

    /// Reads the whole object.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.size()).unwrap_or(usize::MAX);
        self.read_range(0, size)
    }
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the written data.
    ///
    /// After calling `finish`, the writer must not be used again.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or syncing fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The core storage backend trait.
///
/// This trait is object-safe and is shared between partitions as
/// `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieves metadata for an object.
    fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    /// Opens an object for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any previous content.
    /// Parent directories are created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Opens an object for appending, creating it if missing.
    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Deletes an object or a directory tree.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists the entry names directly below `prefix`, sorted.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Renames an object. Within one backend this is atomic.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}
