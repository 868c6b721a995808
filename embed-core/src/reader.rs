// embed-core/src/reader.rs

//! Ordered, batched reading of one partition.
//!
//! A feeder thread pulls work items from the partition enumeration and hands
//! them to a pool of worker threads that read and preprocess them. Results
//! come back out of order; the consumer restores enumeration order with a
//! reorder buffer before cutting batches.
//!
//! Backpressure comes from a permit channel. The feeder needs a permit for
//! every item it pulls and the consumer returns one for every item it takes
//! out of the reorder buffer, so at most `queue_depth` items are ever in
//! flight or buffered, however far preprocessing runs ahead of inference.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::{Modalities, PipelineConfig};
use crate::error::{panic_message, EmbedError, ItemError, Result};
use crate::inference::Preprocess;
use crate::source::WorkItem;
use crate::storage::StorageBackend;

/// An item ready for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedItem {
    pub index: u64,
    pub key: String,
    /// Preprocessed image tensor, when images are enabled.
    pub image: Option<Vec<f32>>,
    /// Caption tokens, when text is enabled.
    pub tokens: Option<Vec<i64>>,
    pub caption: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Up to `batch_size` prepared items in enumeration order.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based position of the batch within its partition.
    pub batch_index: u64,
    pub items: Vec<PreparedItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().map(|item| item.index)
    }
}

/// Reader tuning for one partition.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub queue_depth: usize,
    pub max_consecutive_failures: u32,
    pub modalities: Modalities,
}

impl ReaderOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let batch_size = config.inference.batch_size;
        Self {
            batch_size,
            workers: config.inference.num_prepro_workers,
            queue_depth: config.reader.effective_queue_depth(batch_size),
            max_consecutive_failures: config.reader.max_consecutive_failures,
            modalities: config.inference.modalities(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::config("batch_size must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(EmbedError::config("worker count must be greater than 0"));
        }
        if self.queue_depth == 0 {
            return Err(EmbedError::config("queue_depth must be greater than 0"));
        }
        if !self.modalities.any() {
            return Err(EmbedError::config("at least one modality must be enabled"));
        }
        Ok(())
    }
}

/// Items seen and skipped so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderCounters {
    pub seen: u64,
    pub skipped: u64,
}

type ItemOutcome = std::result::Result<PreparedItem, ItemError>;

/// Streams ordered batches for one partition.
pub struct Reader {
    partition_id: u32,
    options: ReaderOptions,
    /// Results from the workers, tagged with their enumeration sequence.
    results: Option<Receiver<(u64, ItemOutcome)>>,
    /// Returns capacity to the feeder.
    permits: Option<Sender<()>>,
    reorder: BTreeMap<u64, ItemOutcome>,
    next_seq: u64,
    next_batch_index: u64,
    consecutive_failures: u32,
    counters: ReaderCounters,
    stop_flag: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    exhausted: bool,
}

impl Reader {
    /// Starts the feeder and worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or a thread cannot be spawned.
    pub fn new<I>(
        partition_id: u32,
        items: I,
        storage: Arc<dyn StorageBackend>,
        preprocess: Arc<dyn Preprocess>,
        options: ReaderOptions,
    ) -> Result<Self>
    where
        I: Iterator<Item = WorkItem> + Send + 'static,
    {
        options.validate()?;

        let (permit_tx, permit_rx) = channel::bounded::<()>(options.queue_depth);
        for _ in 0..options.queue_depth {
            // Cannot fail: the channel has exactly this much capacity.
            let _ = permit_tx.send(());
        }
        let (work_tx, work_rx) = channel::bounded::<(u64, WorkItem)>(options.workers);
        let (result_tx, result_rx) = channel::bounded(options.queue_depth);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let mut reader = Self {
            partition_id,
            options,
            results: Some(result_rx),
            permits: Some(permit_tx),
            reorder: BTreeMap::new(),
            next_seq: 0,
            next_batch_index: 0,
            consecutive_failures: 0,
            counters: ReaderCounters::default(),
            stop_flag: Arc::clone(&stop_flag),
            threads: Vec::with_capacity(options.workers + 1),
            exhausted: false,
        };

        let feeder_stop = Arc::clone(&stop_flag);
        reader.spawn(format!("reader-{partition_id}-feed"), move || {
            let mut items = items;
            let mut seq = 0u64;
            loop {
                // A permit is taken before the enumeration is advanced.
                if permit_rx.recv().is_err() || feeder_stop.load(Ordering::Relaxed) {
                    return;
                }
                let Some(item) = items.next() else {
                    return;
                };
                if work_tx.send((seq, item)).is_err() {
                    return;
                }
                seq += 1;
            }
        })?;

        for worker in 0..options.workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let storage = Arc::clone(&storage);
            let preprocess = Arc::clone(&preprocess);
            let stop = Arc::clone(&stop_flag);
            let modalities = options.modalities;

            reader.spawn(format!("reader-{partition_id}-{worker}"), move || {
                for (seq, item) in work_rx {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    // A panicking item is skipped like any other bad item; the
                    // consumer still needs a result for every sequence number.
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        prepare(&item, storage.as_ref(), preprocess.as_ref(), modalities)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(ItemError::new(
                            item.index,
                            item.key.clone(),
                            format!("preprocessing panicked: {}", panic_message(payload)),
                        ))
                    });
                    if result_tx.send((seq, outcome)).is_err() {
                        return;
                    }
                }
            })?;
        }

        Ok(reader)
    }

    fn spawn(&mut self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name).spawn(f).map_err(|e| {
            EmbedError::partition_fatal(
                self.partition_id,
                format!("failed to spawn reader thread: {e}"),
            )
        })?;
        self.threads.push(handle);
        Ok(())
    }

    /// Returns the next batch, or `None` once the partition is exhausted.
    ///
    /// # Errors
    ///
    /// Returns a partition-fatal error when more than
    /// `max_consecutive_failures` items in a row fail, or when a worker dies
    /// without delivering its item.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut items = Vec::with_capacity(self.options.batch_size);

        while items.len() < self.options.batch_size {
            match self.next_outcome()? {
                None => {
                    self.exhausted = true;
                    break;
                }
                Some(Ok(item)) => {
                    self.counters.seen += 1;
                    self.consecutive_failures = 0;
                    items.push(item);
                }
                Some(Err(err)) => {
                    self.counters.seen += 1;
                    self.counters.skipped += 1;
                    self.consecutive_failures += 1;
                    tracing::debug!(
                        partition_id = self.partition_id,
                        index = err.index,
                        key = %err.key,
                        reason = %err.reason,
                        "skipping item"
                    );

                    if self.consecutive_failures > self.options.max_consecutive_failures {
                        self.exhausted = true;
                        return Err(EmbedError::partition_fatal(
                            self.partition_id,
                            format!(
                                "{} consecutive items failed, last: {err}",
                                self.consecutive_failures
                            ),
                        ));
                    }
                }
            }
        }

        if items.is_empty() {
            return Ok(None);
        }

        let batch = Batch {
            batch_index: self.next_batch_index,
            items,
        };
        self.next_batch_index += 1;
        Ok(Some(batch))
    }

    /// Next outcome in enumeration order.
    fn next_outcome(&mut self) -> Result<Option<ItemOutcome>> {
        loop {
            if let Some(outcome) = self.reorder.remove(&self.next_seq) {
                self.next_seq += 1;
                if let Some(permits) = &self.permits {
                    // The feeder may already be gone.
                    let _ = permits.send(());
                }
                return Ok(Some(outcome));
            }

            let Some(results) = &self.results else {
                return Ok(None);
            };

            match results.recv() {
                Ok((seq, outcome)) => {
                    self.reorder.insert(seq, outcome);
                }
                Err(_) => {
                    // Every worker has exited.
                    self.results = None;
                    if !self.reorder.is_empty() {
                        self.exhausted = true;
                        return Err(EmbedError::partition_fatal(
                            self.partition_id,
                            format!(
                                "reader worker exited before delivering item {}",
                                self.next_seq
                            ),
                        ));
                    }
                }
            }
        }
    }

    pub fn counters(&self) -> ReaderCounters {
        self.counters
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Stops the threads and waits for them to exit.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.permits = None;
        self.results = None;

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(partition_id = self.partition_id, "reader thread panicked");
            }
        }
    }
}

fn prepare(
    item: &WorkItem,
    storage: &dyn StorageBackend,
    preprocess: &dyn Preprocess,
    modalities: Modalities,
) -> ItemOutcome {
    let raw = item.materialize(storage, modalities)?;
    let fail = |what: &str, e: crate::error::CapabilityError| {
        ItemError::new(raw.index, raw.key.clone(), format!("{what} preprocessing failed: {e}"))
    };

    let image = match (&raw.image, modalities.image) {
        (Some(bytes), true) => Some(preprocess.image(bytes).map_err(|e| fail("image", e))?),
        _ => None,
    };
    let tokens = match (&raw.caption, modalities.text) {
        (Some(caption), true) => Some(preprocess.text(caption).map_err(|e| fail("text", e))?),
        _ => None,
    };

    Ok(PreparedItem {
        index: raw.index,
        key: raw.key,
        image,
        tokens,
        caption: raw.caption,
        metadata: raw.metadata,
    })
}

impl Iterator for Reader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stop();
    }
}
