// embed-core/src/source.rs

//! Input sources and work items.
//!
//! A source is an indexed, immutable collection of [`WorkItem`] references.
//! Enumeration only touches names; reading the referenced bytes happens in
//! the reader's workers through [`WorkItem::materialize`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::config::Modalities;
use crate::error::{ItemError, Result};
use crate::storage::StorageBackend;

/// File extensions recognized as image payloads.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif"];

/// Where the bytes of one field of a work item live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A path resolved through the storage backend.
    Path(PathBuf),
    /// Inline bytes.
    Bytes(Bytes),
}

impl Payload {
    fn load(&self, storage: &dyn StorageBackend) -> Result<Bytes> {
        match self {
            Self::Path(path) => Ok(Bytes::from(storage.open_read(path)?.read_all()?)),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

/// A raw input reference with a stable global index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Position of the item in the source enumeration.
    pub index: u64,
    /// Stable name of the item (the file stem for folder sources).
    pub key: String,
    pub image: Option<Payload>,
    pub text: Option<Payload>,
    /// JSON object with pass-through metadata.
    pub metadata: Option<Payload>,
}

/// A work item whose fields have been read into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub index: u64,
    pub key: String,
    pub image: Option<Bytes>,
    pub caption: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl WorkItem {
    pub fn new(index: u64, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            image: None,
            text: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<Payload>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<Payload>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<Payload>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Reads every field needed by the enabled modalities.
    ///
    /// The caption is loaded whenever text or metadata is enabled, since
    /// the metadata artifact carries it alongside each row.
    ///
    /// # Errors
    ///
    /// Returns an [`ItemError`] if a required field is missing, unreadable,
    /// or malformed. Item errors never abort the partition.
    pub fn materialize(
        &self,
        storage: &dyn StorageBackend,
        modalities: Modalities,
    ) -> std::result::Result<RawItem, ItemError> {
        let fail = |reason: String| ItemError::new(self.index, self.key.clone(), reason);

        let image = match (&self.image, modalities.image) {
            (Some(payload), true) => Some(
                payload
                    .load(storage)
                    .map_err(|e| fail(format!("cannot read image: {e}")))?,
            ),
            (None, true) => return Err(fail("no image payload".to_string())),
            (_, false) => None,
        };

        let caption = match &self.text {
            Some(payload) if modalities.text || modalities.metadata => {
                let bytes = payload
                    .load(storage)
                    .map_err(|e| fail(format!("cannot read caption: {e}")))?;
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| fail("caption is not valid UTF-8".to_string()))?;
                Some(text.trim_end().to_string())
            }
            None if modalities.text => return Err(fail("no caption payload".to_string())),
            _ => None,
        };

        let metadata = match &self.metadata {
            Some(payload) if modalities.metadata => {
                let bytes = payload
                    .load(storage)
                    .map_err(|e| fail(format!("cannot read metadata: {e}")))?;
                Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| fail(format!("invalid metadata JSON: {e}")))?,
                )
            }
            _ => None,
        };

        Ok(RawItem {
            index: self.index,
            key: self.key.clone(),
            image,
            caption,
            metadata,
        })
    }
}

/// An indexed collection of work items.
///
/// Implementations must return the same item for the same index on every
/// call, so that a retried partition re-enumerates identical work.
pub trait ItemSource: Send + Sync {
    /// Total number of items.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the item at `index`, or `None` past the end.
    fn get(&self, index: u64) -> Option<WorkItem>;
}

/// An in-memory source. Indices are reassigned to match positions.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    items: Vec<WorkItem>,
}

impl VecSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        let items = items
            .into_iter()
            .enumerate()
            .map(|(i, mut item)| {
                item.index = i as u64;
                item
            })
            .collect();
        Self { items }
    }
}

impl ItemSource for VecSource {
    fn len(&self) -> u64 {
        self.items.len() as u64
    }

    fn get(&self, index: u64) -> Option<WorkItem> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.items.get(i))
            .cloned()
    }
}

#[derive(Default)]
struct FolderEntry {
    image: Option<PathBuf>,
    text: Option<PathBuf>,
    metadata: Option<PathBuf>,
}

/// A folder of files grouped by stem.
///
/// `cat.jpg`, `cat.txt` and `cat.json` form one item keyed `cat`. Keys are
/// sorted so that indices are stable across runs. Only keys carrying every
/// required payload (image when images are enabled, caption when text is
/// enabled) are enumerated.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
    items: Vec<WorkItem>,
}

impl FolderSource {
    /// Scans `root` recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed.
    pub fn open(
        storage: &dyn StorageBackend,
        root: impl Into<PathBuf>,
        modalities: Modalities,
    ) -> Result<Self> {
        let root = root.into();
        let mut entries: BTreeMap<String, FolderEntry> = BTreeMap::new();
        scan(storage, &root, Path::new(""), &mut entries)?;

        let items = entries
            .into_iter()
            .filter(|(_, entry)| {
                (!modalities.image || entry.image.is_some())
                    && (!modalities.text || entry.text.is_some())
            })
            .enumerate()
            .map(|(index, (key, entry))| WorkItem {
                index: index as u64,
                key,
                image: entry.image.map(|p| Payload::Path(root.join(p))),
                text: entry.text.map(|p| Payload::Path(root.join(p))),
                metadata: entry.metadata.map(|p| Payload::Path(root.join(p))),
            })
            .collect::<Vec<_>>();

        tracing::debug!(root = %root.display(), items = items.len(), "scanned input folder");

        Ok(Self { root, items })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn scan(
    storage: &dyn StorageBackend,
    root: &Path,
    relative: &Path,
    entries: &mut BTreeMap<String, FolderEntry>,
) -> Result<()> {
    for name in storage.list(&root.join(relative))? {
        if name.starts_with('.') {
            continue;
        }
        let rel_path = relative.join(&name);

        if storage.metadata(&root.join(&rel_path))?.is_dir {
            scan(storage, root, &rel_path, entries)?;
            continue;
        }

        let Some(ext) = rel_path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let ext = ext.to_lowercase();
        let key = rel_path.with_extension("").to_string_lossy().into_owned();

        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            entries.entry(key).or_default().image = Some(rel_path);
        } else if ext == "txt" {
            entries.entry(key).or_default().text = Some(rel_path);
        } else if ext == "json" {
            entries.entry(key).or_default().metadata = Some(rel_path);
        }
    }
    Ok(())
}

impl ItemSource for FolderSource {
    fn len(&self) -> u64 {
        self.items.len() as u64
    }

    fn get(&self, index: u64) -> Option<WorkItem> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.items.get(i))
            .cloned()
    }
}
