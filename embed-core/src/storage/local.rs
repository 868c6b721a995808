// embed-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Objects are plain files below a base directory. Large reads (shard
//! artifacts being verified or re-read) go through a memory map, small ones
//! through a buffered reader.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{EmbedError, Result};

/// Local filesystem storage backend.
pub struct LocalStorage {
    /// Base path for all storage operations.
    base_path: PathBuf,
    /// Buffer size for buffered I/O operations.
    buffer_size: usize,
    /// Whether to use memory-mapped I/O.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                EmbedError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    /// Returns the base directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolves a path relative to the base path.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    EmbedError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).map_err(|e| {
            EmbedError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        Ok(ObjectMeta {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| EmbedError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                EmbedError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the map lives as long
            // as the reader. Shard artifacts are never modified in place; they
            // only appear through rename.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                EmbedError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;
            Ok(Box::new(MmapReader::new(mmap, full_path)))
        } else {
            Ok(Box::new(LocalReader::new(
                file,
                size,
                self.buffer_size,
                full_path,
            )))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| EmbedError::storage_with_source(&full_path, "failed to create file", e))?;

        Ok(Box::new(LocalWriter::new(file, self.buffer_size, full_path)))
    }

    fn open_append(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&full_path)
            .map_err(|e| {
                EmbedError::storage_with_source(&full_path, "failed to open file for append", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, self.buffer_size, full_path)))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).map_err(|e| {
                EmbedError::storage_with_source(&full_path, "failed to delete directory", e)
            })
        } else {
            fs::remove_file(&full_path).map_err(|e| {
                EmbedError::storage_with_source(&full_path, "failed to delete file", e)
            })
        }
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);

        if !full_path.exists() {
            return Ok(Vec::new());
        }

        if !full_path.is_dir() {
            return Err(EmbedError::storage(&full_path, "path is not a directory"));
        }

        let mut entries = Vec::new();

        for entry in fs::read_dir(&full_path).map_err(|e| {
            EmbedError::storage_with_source(&full_path, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                EmbedError::storage_with_source(&full_path, "failed to read directory entry", e)
            })?;

            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            EmbedError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }
}

/// Buffered file reader for local storage.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl LocalReader {
    fn new(file: File, size: u64, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            path,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(start)).map_err(|e| {
            EmbedError::storage_with_source(
                &self.path,
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf).map_err(|e| {
            EmbedError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at position {start}"),
                e,
            )
        })?;

        Ok(buf)
    }
}

/// Memory-mapped file reader for local storage.
struct MmapReader {
    mmap: Mmap,
    position: u64,
    path: PathBuf,
}

impl MmapReader {
    fn new(mmap: Mmap, path: PathBuf) -> Self {
        Self {
            mmap,
            position: 0,
            path,
        }
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = usize::try_from(self.position)
            .unwrap_or(usize::MAX)
            .min(self.mmap.len());
        let remaining = &self.mmap[pos..];
        let to_read = buf.len().min(remaining.len());

        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.position += to_read as u64;
        Ok(to_read)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.mmap.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        let end = start.saturating_add(length);

        if end > self.mmap.len() {
            return Err(EmbedError::storage(
                &self.path,
                format!(
                    "read range {}..{} exceeds file size {}",
                    start,
                    end,
                    self.mmap.len()
                ),
            ));
        }

        Ok(self.mmap[start..end].to_vec())
    }
}

/// Buffered file writer for local storage.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| {
            EmbedError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;

        self.writer.get_ref().sync_all().map_err(|e| {
            EmbedError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024, // Low threshold for testing
        };
        let storage = LocalStorage::new(&config).unwrap();
        (storage, temp_dir)
    }

    fn write_file(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("out");

        let config = StorageConfig {
            base_path: new_base.clone(),
            ..Default::default()
        };

        let storage = LocalStorage::new(&config).unwrap();
        assert!(new_base.exists());
        assert_eq!(storage.base_path(), new_base.as_path());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let (storage, _temp) = create_test_storage();

        write_file(&storage, "img_emb/img_emb_0.npy", b"rows");

        assert!(storage.exists(Path::new("img_emb/img_emb_0.npy")).unwrap());
        let meta = storage.metadata(Path::new("img_emb")).unwrap();
        assert!(meta.is_dir);
    }

    #[test]
    fn test_read_all_small_and_mmapped() {
        let (storage, _temp) = create_test_storage();

        write_file(&storage, "small.bin", b"hello world");
        let large: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        write_file(&storage, "large.bin", &large);

        let mut reader = storage.open_read(Path::new("small.bin")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"hello world");

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.size(), 4096);
        assert_eq!(reader.read_all().unwrap(), large);
        assert_eq!(reader.read_range(100, 50).unwrap(), &large[100..150]);
    }

    #[test]
    fn test_mmap_read_range_out_of_bounds() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "large.bin", &vec![7u8; 2048]);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert!(reader.read_range(2000, 100).is_err());
    }

    #[test]
    fn test_mmap_seek_and_read() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.seek(SeekFrom::End(-2)).unwrap(), 2046);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, &data[2046..]);

        assert!(reader.seek(SeekFrom::Current(-5000)).is_err());
    }

    #[test]
    fn test_append_accumulates() {
        let (storage, _temp) = create_test_storage();

        for chunk in [&b"abc"[..], &b"def"[..]] {
            let mut writer = storage.open_append(Path::new("part/rows.bin")).unwrap();
            writer.write_all(chunk).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = storage.open_read(Path::new("part/rows.bin")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"abcdef");
    }

    #[test]
    fn test_open_write_truncates() {
        let (storage, _temp) = create_test_storage();

        write_file(&storage, "stats/stats_0.json", b"{\"old\": true}");
        write_file(&storage, "stats/stats_0.json", b"{}");

        let mut reader = storage.open_read(Path::new("stats/stats_0.json")).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"{}");
    }

    #[test]
    fn test_list_sorted_and_missing() {
        let (storage, _temp) = create_test_storage();

        for name in ["c.jpg", "a.jpg", "b.txt"] {
            write_file(&storage, &format!("images/{name}"), b"x");
        }

        let entries = storage.list(Path::new("images")).unwrap();
        assert_eq!(entries, vec!["a.jpg", "b.txt", "c.jpg"]);
        assert!(storage.list(Path::new("missing")).unwrap().is_empty());
        assert!(storage.list(Path::new("images/a.jpg")).is_err());
    }

    #[test]
    fn test_rename_into_new_directory() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, ".tmp/shard.part", b"rows");

        storage
            .rename(Path::new(".tmp/shard.part"), Path::new("img_emb/img_emb_1.npy"))
            .unwrap();

        assert!(!storage.exists(Path::new(".tmp/shard.part")).unwrap());
        assert!(storage.exists(Path::new("img_emb/img_emb_1.npy")).unwrap());
        assert!(storage
            .rename(Path::new("missing"), Path::new("other"))
            .is_err());
    }

    #[test]
    fn test_delete_file_and_directory() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "dir/file.txt", b"hello");

        storage.delete(Path::new("dir/file.txt")).unwrap();
        assert!(!storage.exists(Path::new("dir/file.txt")).unwrap());

        write_file(&storage, "dir/other.txt", b"hello");
        storage.delete(Path::new("dir")).unwrap();
        assert!(!storage.exists(Path::new("dir")).unwrap());

        assert!(storage.delete(Path::new("nonexistent.txt")).is_err());
    }

    #[test]
    fn test_mmap_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: false,
            mmap_threshold: 1024,
        };
        let storage = LocalStorage::new(&config).unwrap();

        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_all().unwrap(), data);
    }
}
