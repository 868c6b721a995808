// embed-core/src/writer.rs

//! Shard output.
//!
//! Records are routed to shards by `index mod shard_count`. Partition `p`
//! enumerates exactly the indices congruent to `p`, so with as many
//! partitions as shards every partition owns one shard outright and no two
//! writers ever touch the same files.
//!
//! While a partition runs, rows are spilled to hidden `.part` files next to
//! their final location. Finalization streams each part into its artifact
//! through a temporary file and a rename, then writes the shard's completion
//! manifest. A shard is complete iff its manifest exists.

use std::hash::Hasher;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::config::{Modalities, PipelineConfig};
use crate::error::{EmbedError, Result};
use crate::mapper::EmbeddingRecord;
use crate::npy::{self, Matrix};
use crate::storage::{temp_path_for, write_atomic, StorageBackend};

/// Chunk size used when streaming part files into artifacts.
const COPY_CHUNK: usize = 64 * 1024;

/// An embedded modality with its own array artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Image,
    Text,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Image, Modality::Text];

    /// Directory and file prefix of the artifacts.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Image => "img_emb",
            Self::Text => "text_emb",
        }
    }

    pub fn enabled(self, modalities: Modalities) -> bool {
        match self {
            Self::Image => modalities.image,
            Self::Text => modalities.text,
        }
    }

    fn vector(self, record: &EmbeddingRecord) -> Option<&Vec<f32>> {
        match self {
            Self::Image => record.image.as_ref(),
            Self::Text => record.text.as_ref(),
        }
    }
}

/// Naming and routing of shard artifacts below the output folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    output_folder: PathBuf,
    shard_count: u32,
}

impl ShardLayout {
    /// # Errors
    ///
    /// Returns a configuration error if `shard_count` is zero.
    pub fn new(output_folder: impl Into<PathBuf>, shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(EmbedError::config("shard count must be greater than 0"));
        }
        Ok(Self {
            output_folder: output_folder.into(),
            shard_count,
        })
    }

    pub fn output_folder(&self) -> &Path {
        &self.output_folder
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard receiving the record with `global_index`.
    pub fn shard_of(&self, global_index: u64) -> u32 {
        (global_index % u64::from(self.shard_count)) as u32
    }

    /// Shard id zero-padded to the digit count of the shard count.
    pub fn shard_name(&self, shard_id: u32) -> String {
        let width = self.shard_count.to_string().len();
        format!("{shard_id:0width$}")
    }

    pub fn embedding_path(&self, modality: Modality, shard_id: u32) -> PathBuf {
        let prefix = modality.prefix();
        self.output_folder
            .join(prefix)
            .join(format!("{prefix}_{}.npy", self.shard_name(shard_id)))
    }

    pub fn metadata_path(&self, shard_id: u32) -> PathBuf {
        self.output_folder
            .join("metadata")
            .join(format!("metadata_{}.jsonl", self.shard_name(shard_id)))
    }

    pub fn manifest_path(&self, shard_id: u32) -> PathBuf {
        self.output_folder
            .join("_complete")
            .join(format!("shard_{}.json", self.shard_name(shard_id)))
    }

    pub fn is_complete(&self, storage: &dyn StorageBackend, shard_id: u32) -> Result<bool> {
        storage.exists(&self.manifest_path(shard_id))
    }

    pub fn read_manifest(
        &self,
        storage: &dyn StorageBackend,
        shard_id: u32,
    ) -> Result<ShardManifest> {
        let bytes = storage.open_read(&self.manifest_path(shard_id))?.read_all()?;
        serde_json::from_slice(&bytes).map_err(|e| {
            EmbedError::serialization(format!("invalid manifest for shard {shard_id}: {e}"))
        })
    }

    /// Loads one embedding artifact.
    pub fn read_embeddings(
        &self,
        storage: &dyn StorageBackend,
        modality: Modality,
        shard_id: u32,
    ) -> Result<Matrix> {
        let bytes = storage
            .open_read(&self.embedding_path(modality, shard_id))?
            .read_all()?;
        Matrix::from_npy(&bytes)
    }

    /// Loads the metadata artifact of a shard.
    pub fn read_metadata(
        &self,
        storage: &dyn StorageBackend,
        shard_id: u32,
    ) -> Result<Vec<MetadataRow>> {
        let bytes = storage.open_read(&self.metadata_path(shard_id))?.read_all()?;
        bytes
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_slice(line)
                    .map_err(|e| EmbedError::serialization(format!("invalid metadata row: {e}")))
            })
            .collect()
    }

    /// Re-hashes every artifact listed in a completed shard's manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is incomplete or an artifact differs
    /// from its recorded checksum.
    pub fn verify(&self, storage: &dyn StorageBackend, shard_id: u32) -> Result<ShardManifest> {
        let manifest = self.read_manifest(storage, shard_id)?;

        for artifact in &manifest.artifacts {
            let path = self.output_folder.join(&artifact.path);
            let bytes = storage.open_read(&path)?.read_all()?;
            let mut hasher = XxHash64::with_seed(0);
            hasher.write(&bytes);
            let actual = format!("{:016x}", hasher.finish());

            if actual != artifact.checksum {
                return Err(EmbedError::storage(
                    path,
                    format!(
                        "checksum mismatch: expected {}, got {actual}",
                        artifact.checksum
                    ),
                ));
            }
        }

        Ok(manifest)
    }
}

/// One line of the metadata artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub index: u64,
    pub key: String,
    pub caption: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One published artifact of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the output folder.
    pub path: String,
    /// `None` for the metadata artifact.
    pub modality: Option<Modality>,
    pub dimension: Option<usize>,
    pub bytes: u64,
    /// XXHash64 (seed 0) of the artifact bytes, hex encoded.
    pub checksum: String,
}

/// Completion marker of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub shard_id: u32,
    pub shard_count: u32,
    pub rows: u64,
    /// Partitions that contributed rows.
    pub partitions: Vec<u32>,
    pub artifacts: Vec<ArtifactEntry>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub modalities: Modalities,
    /// Rows held in memory before spilling to the part files.
    pub flush_threshold: usize,
}

impl WriterOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            modalities: config.inference.modalities(),
            flush_threshold: config.output.flush_threshold,
        }
    }
}

/// Writes the shard owned by one partition.
pub struct ShardWriter {
    partition_id: u32,
    shard_id: u32,
    layout: ShardLayout,
    storage: Arc<dyn StorageBackend>,
    options: WriterOptions,
    buffer: Vec<EmbeddingRecord>,
    spilled_rows: u64,
    image_dim: Option<usize>,
    text_dim: Option<usize>,
    dimension_hint: Option<usize>,
}

impl ShardWriter {
    /// Opens the writer for `partition_id`'s shard.
    ///
    /// Any previous completion manifest of the shard is removed and its part
    /// files are truncated, so a retried partition starts from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`EmbedError::InvalidPartition`] if the partition has no shard,
    /// or a storage error.
    pub fn new(
        partition_id: u32,
        layout: ShardLayout,
        storage: Arc<dyn StorageBackend>,
        options: WriterOptions,
    ) -> Result<Self> {
        if partition_id >= layout.shard_count() {
            return Err(EmbedError::invalid_partition(
                partition_id,
                layout.shard_count(),
            ));
        }
        let shard_id = partition_id;

        let manifest = layout.manifest_path(shard_id);
        if storage.exists(&manifest)? {
            tracing::debug!(shard_id, "removing stale completion manifest");
            storage.delete(&manifest)?;
        }

        let writer = Self {
            partition_id,
            shard_id,
            layout,
            storage,
            options,
            buffer: Vec::with_capacity(options.flush_threshold.min(4096)),
            spilled_rows: 0,
            image_dim: None,
            text_dim: None,
            dimension_hint: None,
        };

        for part in writer.part_paths() {
            writer.storage.open_write(&part)?.finish()?;
        }

        Ok(writer)
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Rows accepted so far, spilled or buffered.
    pub fn rows(&self) -> u64 {
        self.spilled_rows + self.buffer.len() as u64
    }

    /// Dimension recorded for an empty shard.
    pub fn set_dimension(&mut self, dimension: usize) {
        self.dimension_hint = Some(dimension);
    }

    fn part_paths(&self) -> Vec<PathBuf> {
        let mut targets: Vec<PathBuf> = Modality::ALL
            .into_iter()
            .filter(|m| m.enabled(self.options.modalities))
            .map(|m| self.layout.embedding_path(m, self.shard_id))
            .collect();
        if self.options.modalities.metadata {
            targets.push(self.layout.metadata_path(self.shard_id));
        }
        targets.iter().map(|t| part_path_for(t)).collect()
    }

    /// Accepts mapper output.
    ///
    /// # Errors
    ///
    /// Returns a partition-fatal error for a record outside this writer's
    /// shard, a missing vector or a dimension change.
    pub fn write(&mut self, records: Vec<EmbeddingRecord>) -> Result<()> {
        for record in records {
            let shard = self.layout.shard_of(record.index);
            if shard != self.shard_id {
                return Err(EmbedError::partition_fatal(
                    self.partition_id,
                    format!(
                        "record {} belongs to shard {shard}, writer owns shard {}",
                        record.index, self.shard_id
                    ),
                ));
            }

            for modality in Modality::ALL {
                if !modality.enabled(self.options.modalities) {
                    continue;
                }
                let partition_id = self.partition_id;
                let len = modality
                    .vector(&record)
                    .map(Vec::len)
                    .ok_or_else(|| {
                        EmbedError::partition_fatal(
                            partition_id,
                            format!(
                                "record {} has no {} embedding",
                                record.index,
                                modality.prefix()
                            ),
                        )
                    })?;
                let slot = match modality {
                    Modality::Image => &mut self.image_dim,
                    Modality::Text => &mut self.text_dim,
                };
                match *slot {
                    Some(dim) if dim != len => {
                        return Err(EmbedError::partition_fatal(
                            partition_id,
                            format!(
                                "record {} has {} dimension {len}, shard has {dim}",
                                record.index,
                                modality.prefix()
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => *slot = Some(len),
                }
            }

            self.buffer.push(record);
        }

        if self.buffer.len() >= self.options.flush_threshold {
            self.spill()?;
        }
        Ok(())
    }

    /// Appends the buffered rows to the part files.
    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        for modality in Modality::ALL {
            if !modality.enabled(self.options.modalities) {
                continue;
            }
            let mut bytes = Vec::new();
            for record in &self.buffer {
                if let Some(vector) = modality.vector(record) {
                    npy::extend_row(&mut bytes, vector);
                }
            }
            let part = part_path_for(&self.layout.embedding_path(modality, self.shard_id));
            self.append(&part, &bytes)?;
        }

        if self.options.modalities.metadata {
            let mut bytes = Vec::new();
            for record in &self.buffer {
                let row = MetadataRow {
                    index: record.index,
                    key: record.key.clone(),
                    caption: record.caption.clone(),
                    metadata: record.metadata.clone(),
                };
                serde_json::to_writer(&mut bytes, &row).map_err(|e| {
                    EmbedError::serialization(format!("failed to encode metadata row: {e}"))
                })?;
                bytes.push(b'\n');
            }
            let part = part_path_for(&self.layout.metadata_path(self.shard_id));
            self.append(&part, &bytes)?;
        }

        tracing::debug!(
            shard_id = self.shard_id,
            rows = self.buffer.len(),
            "spilled rows to part files"
        );
        self.spilled_rows += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn append(&self, part: &Path, bytes: &[u8]) -> Result<()> {
        let mut writer = self.storage.open_append(part)?;
        writer
            .write_all(bytes)
            .map_err(|e| EmbedError::storage_with_source(part, "failed to append rows", e))?;
        writer.finish()
    }

    /// Publishes every artifact and marks the shard complete.
    ///
    /// # Errors
    ///
    /// Returns a storage error if an artifact cannot be published. The shard
    /// then stays incomplete.
    pub fn finalize(mut self) -> Result<ShardManifest> {
        self.spill()?;
        let rows = self.spilled_rows;
        let mut artifacts = Vec::new();

        for modality in Modality::ALL {
            if !modality.enabled(self.options.modalities) {
                continue;
            }
            let dim = match modality {
                Modality::Image => self.image_dim,
                Modality::Text => self.text_dim,
            }
            .or(self.dimension_hint)
            .unwrap_or(0);

            let target = self.layout.embedding_path(modality, self.shard_id);
            let mut entry = self.publish(&target, &npy::header(rows, dim))?;
            entry.modality = Some(modality);
            entry.dimension = Some(dim);
            artifacts.push(entry);
        }

        if self.options.modalities.metadata {
            let target = self.layout.metadata_path(self.shard_id);
            artifacts.push(self.publish(&target, &[])?);
        }

        let manifest = ShardManifest {
            shard_id: self.shard_id,
            shard_count: self.layout.shard_count(),
            rows,
            partitions: vec![self.partition_id],
            artifacts,
            completed_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| {
            EmbedError::serialization(format!("failed to encode shard manifest: {e}"))
        })?;
        write_atomic(
            self.storage.as_ref(),
            &self.layout.manifest_path(self.shard_id),
            &bytes,
        )?;

        tracing::info!(shard_id = self.shard_id, rows, "shard complete");
        Ok(manifest)
    }

    /// Streams `prefix` and the part file into `target` via a temporary
    /// sibling and a rename, then removes the part file.
    fn publish(&self, target: &Path, prefix: &[u8]) -> Result<ArtifactEntry> {
        let part = part_path_for(target);
        let temp = temp_path_for(target);
        let mut hasher = XxHash64::with_seed(0);
        let mut total = prefix.len() as u64;

        let mut writer = self.storage.open_write(&temp)?;
        writer
            .write_all(prefix)
            .map_err(|e| EmbedError::storage_with_source(&temp, "failed to write header", e))?;
        hasher.write(prefix);

        let mut reader = self.storage.open_read(&part)?;
        let mut chunk = vec![0u8; COPY_CHUNK];
        loop {
            let n = reader
                .read(&mut chunk)
                .map_err(|e| EmbedError::storage_with_source(&part, "failed to read rows", e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&chunk[..n])
                .map_err(|e| EmbedError::storage_with_source(&temp, "failed to write rows", e))?;
            hasher.write(&chunk[..n]);
            total += n as u64;
        }
        drop(reader);

        writer.finish()?;
        self.storage.rename(&temp, target)?;
        self.storage.delete(&part)?;

        let relative = target
            .strip_prefix(self.layout.output_folder())
            .unwrap_or(target);

        Ok(ArtifactEntry {
            path: relative.to_string_lossy().into_owned(),
            modality: None,
            dimension: None,
            bytes: total,
            checksum: format!("{:016x}", hasher.finish()),
        })
    }
}

/// Hidden sibling receiving rows before an artifact is published.
fn part_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{file_name}.part"))
}
