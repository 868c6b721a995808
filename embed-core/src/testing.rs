// embed-core/src/testing.rs

//! Test doubles shared by the unit tests: a deterministic fake inference
//! capability, work item builders and corruption injection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::{InferenceConfig, Modalities, StorageConfig};
use crate::inference::{
    CapabilityResult, EmbeddingModel, InferenceCapability, LoadOptions, LoadedCapability,
    Preprocess,
};
use crate::logger::StatsLogger;
use crate::mapper::{Mapper, MapperOptions};
use crate::reader::{Reader, ReaderOptions};
use crate::runner::{LoggerFactory, MapperFactory, ReaderFactory, Runner, WriterFactory};
use crate::sampler::Sampler;
use crate::source::{ItemSource, VecSource, WorkItem};
use crate::storage::{LocalStorage, StorageBackend};
use crate::writer::{ShardLayout, ShardWriter, WriterOptions};

/// Image payloads starting with this marker fail preprocessing.
pub const CORRUPT: &[u8] = b"CORRUPT";

/// Image payloads starting with this marker make preprocessing panic.
pub const PANIC: &[u8] = b"PANIC";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelFault {
    #[default]
    None,
    /// Every embedding call fails.
    Error,
    /// Embedding calls return one vector fewer than requested.
    DropsOne,
    /// Embedding calls panic.
    Panics,
}

/// A deterministic capability. Image vectors are derived from the payload
/// bytes, text vectors from the tokens.
#[derive(Clone)]
pub struct FakeCapability {
    dim: usize,
    jitter: bool,
    fault: ModelFault,
    loads: Arc<AtomicUsize>,
    load_fails: bool,
}

impl FakeCapability {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            jitter: false,
            fault: ModelFault::None,
            loads: Arc::new(AtomicUsize::new(0)),
            load_fails: false,
        }
    }

    /// Preprocessing sleeps a payload-dependent few milliseconds, so workers
    /// finish out of order.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn with_fault(mut self, fault: ModelFault) -> Self {
        self.fault = fault;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.load_fails = true;
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn preprocess(&self) -> Arc<dyn Preprocess> {
        Arc::new(FakePreprocess {
            jitter: self.jitter,
        })
    }
}

impl InferenceCapability for FakeCapability {
    fn load(&self, _options: &LoadOptions) -> CapabilityResult<LoadedCapability> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.load_fails {
            return Err("weights not found".into());
        }
        Ok(LoadedCapability {
            model: Arc::new(FakeModel {
                dim: self.dim,
                fault: self.fault,
            }),
            preprocess: self.preprocess(),
        })
    }
}

struct FakePreprocess {
    jitter: bool,
}

impl Preprocess for FakePreprocess {
    fn image(&self, bytes: &[u8]) -> CapabilityResult<Vec<f32>> {
        if bytes.starts_with(CORRUPT) {
            return Err("cannot decode image".into());
        }
        if bytes.starts_with(PANIC) {
            panic!("decoder crashed");
        }
        let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
        if self.jitter {
            std::thread::sleep(Duration::from_millis(u64::from(sum % 4)));
        }
        Ok(vec![bytes.len() as f32, sum as f32])
    }

    fn text(&self, caption: &str) -> CapabilityResult<Vec<i64>> {
        Ok(caption.bytes().map(i64::from).collect())
    }
}

struct FakeModel {
    dim: usize,
    fault: ModelFault,
}

impl FakeModel {
    fn finish(&self, mut vectors: Vec<Vec<f32>>) -> CapabilityResult<Vec<Vec<f32>>> {
        match self.fault {
            ModelFault::None => Ok(vectors),
            ModelFault::Error => Err("device lost".into()),
            ModelFault::DropsOne => {
                vectors.pop();
                Ok(vectors)
            }
            ModelFault::Panics => panic!("inference kernel crashed"),
        }
    }
}

impl EmbeddingModel for FakeModel {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed_images(&self, batch: &[Vec<f32>]) -> CapabilityResult<Vec<Vec<f32>>> {
        let vectors = batch
            .iter()
            .map(|features| {
                (0..self.dim)
                    .map(|j| features[0] + features[1] * (j as f32 + 1.0))
                    .collect()
            })
            .collect();
        self.finish(vectors)
    }

    fn embed_texts(&self, batch: &[Vec<i64>]) -> CapabilityResult<Vec<Vec<f32>>> {
        let vectors = batch
            .iter()
            .map(|tokens| {
                let sum: i64 = tokens.iter().sum();
                (0..self.dim).map(|j| (sum + j as i64) as f32).collect()
            })
            .collect();
        self.finish(vectors)
    }
}

/// `count` items with inline image payloads, keyed `000`, `001`, ...
pub fn image_items(count: u64) -> Vec<WorkItem> {
    (0..count)
        .map(|i| WorkItem::new(i, format!("{i:03}")).with_image(format!("image-{i}").into_bytes()))
        .collect()
}

/// Like [`image_items`], with a caption and a metadata object per item.
pub fn captioned_items(count: u64) -> Vec<WorkItem> {
    image_items(count)
        .into_iter()
        .map(|item| {
            let i = item.index;
            item.with_text(format!("caption {i}").as_str())
                .with_metadata(format!(r#"{{"id": {i}}}"#).as_str())
        })
        .collect()
}

/// Replaces the image payload of the given indices with undecodable bytes.
pub fn corrupt(mut items: Vec<WorkItem>, indices: &[u64]) -> Vec<WorkItem> {
    for item in &mut items {
        if indices.contains(&item.index) {
            item.image = Some(CORRUPT.to_vec().into());
        }
    }
    items
}

/// Replaces the image payload of the given indices with bytes that make
/// preprocessing panic.
pub fn panicking(mut items: Vec<WorkItem>, indices: &[u64]) -> Vec<WorkItem> {
    for item in &mut items {
        if indices.contains(&item.index) {
            item.image = Some(PANIC.to_vec().into());
        }
    }
    items
}

pub fn memory_source(items: Vec<WorkItem>) -> Arc<dyn ItemSource> {
    Arc::new(VecSource::new(items))
}

/// Local storage rooted in a fresh temporary directory.
pub fn temp_storage() -> (Arc<dyn StorageBackend>, TempDir) {
    let temp = TempDir::new().unwrap();
    let storage = LocalStorage::new(&StorageConfig {
        base_path: temp.path().to_path_buf(),
        buffer_size: 4096,
        ..Default::default()
    })
    .unwrap();
    (Arc::new(storage), temp)
}

fn image_only() -> Modalities {
    Modalities {
        image: true,
        ..Default::default()
    }
}

/// A runner over `items` writing image embeddings to `out/` and stats to
/// `out/stats/`, with one shard per partition.
pub fn image_runner(
    items: Vec<WorkItem>,
    partitions: u32,
    batch_size: usize,
    capability: FakeCapability,
    storage: Arc<dyn StorageBackend>,
) -> Runner {
    let sampler = Sampler::new(memory_source(items), partitions).unwrap();
    let layout = ShardLayout::new("out", partitions).unwrap();
    let capability: Arc<dyn InferenceCapability> = Arc::new(capability);

    let reader_storage = Arc::clone(&storage);
    let reader: ReaderFactory = Arc::new(move |pid, preprocess| {
        Reader::new(
            pid,
            sampler.enumerate(pid)?,
            Arc::clone(&reader_storage),
            preprocess,
            ReaderOptions {
                batch_size,
                workers: 3,
                queue_depth: batch_size * 4,
                max_consecutive_failures: 3,
                modalities: image_only(),
            },
        )
    });
    let mapper: MapperFactory = Arc::new(move |pid| {
        Ok(Mapper::new(
            pid,
            Arc::clone(&capability),
            MapperOptions {
                modalities: image_only(),
                normalize: true,
                load: LoadOptions::from_config(&InferenceConfig::default()),
            },
        ))
    });
    let writer_storage = Arc::clone(&storage);
    let writer: WriterFactory = Arc::new(move |pid| {
        ShardWriter::new(
            pid,
            layout.clone(),
            Arc::clone(&writer_storage),
            WriterOptions {
                modalities: image_only(),
                flush_threshold: 3,
            },
        )
    });
    let logger: LoggerFactory =
        Arc::new(move |pid| StatsLogger::new(pid, Arc::clone(&storage), "out/stats"));

    Runner::new(partitions, reader, mapper, writer, logger)
}

/// Routes log output through the test harness. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
