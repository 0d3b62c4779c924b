//! # Packet Processor
//!
//! Per-packet orchestration of extraction → transformation → statistics,
//! producing a structured [`ProcessingResult`] for registered callbacks.
//! Optionally caches results keyed by the raw packet bytes (header
//! included — packets differing only in sequence or timestamp miss) with
//! FIFO eviction, and submits work to its own job pool in parallel mode.
//!
//! No failure escapes [`PacketProcessor::process`]: per-field errors are
//! embedded in the result maps and callback panics are caught and counted.

use crate::config::{ProcessorConfig, StatisticsConfig};
use crate::extract::{ExtractionMap, FieldExtractor};
use crate::registry::PacketCallback;
use crate::stats::StatisticsEngine;
use crate::transform::{DataTransformer, TransformError};
use crate::value::FieldValue;
use crate::workers::WorkerPool;
use pulse_wire::packet::{PacketId, PacketRef};
use pulse_wire::stats::Ewma;
use quanta::Instant;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error};

/// Smoothing factor for the rolling processing-time average.
const TIMING_EWMA_ALPHA: f64 = 0.05;

/// Capacity of the parallel-mode job queue.
const JOB_QUEUE_CAPACITY: usize = 4_096;

// ─── Field selection ────────────────────────────────────────────────────────

/// Per-packet-id processing selection. Empty lists mean "all fields".
#[derive(Debug, Clone, Default)]
pub struct FieldSelection {
    pub extract: Vec<String>,
    pub transform: Vec<String>,
    pub statistics: bool,
}

impl FieldSelection {
    pub fn all() -> Self {
        FieldSelection {
            extract: Vec::new(),
            transform: Vec::new(),
            statistics: true,
        }
    }
}

// ─── Result ─────────────────────────────────────────────────────────────────

/// Structured outcome of processing one packet.
pub struct ProcessingResult {
    pub packet: PacketRef,
    pub extracted: ExtractionMap,
    pub transformed: HashMap<String, Result<FieldValue, TransformError>>,
    pub elapsed_ns: u64,
    /// Top-level failure (e.g. invalid packet); per-field errors live in
    /// the maps above.
    pub error: Option<String>,
}

impl ProcessingResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

pub type ResultCallback = Arc<dyn Fn(&ProcessingResult) + Send + Sync>;

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub processed: AtomicU64,
    pub failures: AtomicU64,
    pub callback_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub peak_ns: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorSnapshot {
    pub processed: u64,
    pub failures: u64,
    pub callback_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_ns: f64,
    pub peak_ns: u64,
}

// ─── Processor ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct ResultCache {
    map: HashMap<u64, Arc<ProcessingResult>>,
    order: VecDeque<u64>,
}

/// Extraction/transformation/statistics pipeline for subscribed packets.
pub struct PacketProcessor {
    config: ProcessorConfig,
    extractor: Arc<FieldExtractor>,
    transformer: Arc<DataTransformer>,
    statistics: Arc<StatisticsEngine>,
    selections: RwLock<HashMap<PacketId, FieldSelection>>,
    callbacks: RwLock<Vec<ResultCallback>>,
    cache: RwLock<ResultCache>,
    stats: ProcessorStats,
    timing: Mutex<Ewma>,
    workers: Option<WorkerPool>,
}

impl PacketProcessor {
    pub fn new(config: ProcessorConfig, statistics: StatisticsConfig) -> Arc<Self> {
        let workers = config.parallel.then(|| {
            WorkerPool::new(
                config.effective_worker_threads(),
                JOB_QUEUE_CAPACITY,
                "pulse-proc",
            )
        });
        Arc::new(PacketProcessor {
            config,
            extractor: Arc::new(FieldExtractor::new()),
            transformer: Arc::new(DataTransformer::new()),
            statistics: Arc::new(StatisticsEngine::new(statistics)),
            selections: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            cache: RwLock::new(ResultCache::default()),
            stats: ProcessorStats::default(),
            timing: Mutex::new(Ewma::new(TIMING_EWMA_ALPHA)),
            workers,
        })
    }

    pub fn extractor(&self) -> &Arc<FieldExtractor> {
        &self.extractor
    }

    pub fn transformer(&self) -> &Arc<DataTransformer> {
        &self.transformer
    }

    pub fn statistics(&self) -> &Arc<StatisticsEngine> {
        &self.statistics
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    /// Restrict processing for one packet-id to named fields.
    pub fn set_selection(&self, packet_id: PacketId, selection: FieldSelection) {
        debug!(
            packet_id,
            extract = selection.extract.len(),
            transform = selection.transform.len(),
            statistics = selection.statistics,
            "field selection set"
        );
        self.selections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(packet_id, selection);
    }

    /// Register a callback invoked with every processing result.
    pub fn add_result_callback(&self, callback: ResultCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Run the full pipeline on one packet. Never panics or propagates an
    /// error; inspect the returned result.
    pub fn process(&self, packet: &PacketRef) -> Arc<ProcessingResult> {
        let started = Instant::now();

        if !packet.is_valid() {
            let result = Arc::new(ProcessingResult {
                packet: Arc::clone(packet),
                extracted: ExtractionMap::new(),
                transformed: HashMap::new(),
                elapsed_ns: started.elapsed().as_nanos() as u64,
                error: Some("invalid packet".into()),
            });
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            self.notify(&result);
            return result;
        }

        let key = self.config.cache_results.then(|| cache_key(packet));
        if let Some(key) = key {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.map.get(&key) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(cached);
            }
            drop(cache);
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let selection = self.selection_for(packet.id());

        let extracted = if self.config.enable_extraction {
            if selection.extract.is_empty() {
                self.extractor.extract_all(packet)
            } else {
                self.extractor.extract_many(packet, &selection.extract)
            }
        } else {
            ExtractionMap::new()
        };

        let mut transformed = HashMap::new();
        if self.config.enable_transformation {
            let transform_paths: Vec<&String> = if selection.transform.is_empty() {
                extracted.keys().collect()
            } else {
                selection.transform.iter().collect()
            };
            for path in transform_paths {
                if let Some(Ok(value)) = extracted.get(path) {
                    transformed.insert(
                        path.clone(),
                        self.transformer.transform(path, value.clone()),
                    );
                }
            }
        }

        if self.config.enable_statistics && selection.statistics {
            self.statistics.update_map(&extracted);
        }

        let elapsed_ns = started.elapsed().as_nanos() as u64;
        let result = Arc::new(ProcessingResult {
            packet: Arc::clone(packet),
            extracted,
            transformed,
            elapsed_ns,
            error: None,
        });

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.peak_ns.fetch_max(elapsed_ns, Ordering::Relaxed);
        self.timing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(elapsed_ns as f64);

        if let Some(key) = key {
            self.cache_insert(key, Arc::clone(&result));
        }

        self.notify(&result);
        result
    }

    /// Process on the worker pool when parallel mode is on; otherwise (or
    /// when the pool is saturated) runs inline. Results arrive via the
    /// registered callbacks.
    pub fn process_async(processor: &Arc<PacketProcessor>, packet: PacketRef) {
        if let Some(workers) = &processor.workers {
            let this = Arc::clone(processor);
            let for_pool = Arc::clone(&packet);
            if workers.execute(move || {
                this.process(&for_pool);
            }) {
                return;
            }
        }
        processor.process(&packet);
    }

    /// Adapt a shared processor into a subscription callback.
    pub fn subscriber(processor: &Arc<PacketProcessor>) -> PacketCallback {
        let this = Arc::clone(processor);
        Arc::new(move |packet: &PacketRef| {
            PacketProcessor::process_async(&this, Arc::clone(packet));
        })
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            processed: self.stats.processed.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            callback_failures: self.stats.callback_failures.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            avg_ns: self.timing.lock().unwrap_or_else(|e| e.into_inner()).value(),
            peak_ns: self.stats.peak_ns.load(Ordering::Relaxed),
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.map.clear();
        cache.order.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .len()
    }

    fn selection_for(&self, packet_id: PacketId) -> FieldSelection {
        self.selections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&packet_id)
            .cloned()
            .unwrap_or_else(FieldSelection::all)
    }

    fn cache_insert(&self, key: u64, result: Arc<ProcessingResult>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.map.contains_key(&key) {
            return;
        }
        while cache.map.len() >= self.config.max_cache_size.max(1) {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.map.remove(&oldest);
                }
                None => break,
            }
        }
        cache.map.insert(key, result);
        cache.order.push_back(key);
    }

    /// Invoke result callbacks; a panicking callback is accounted and never
    /// reaches the delivering router worker.
    fn notify(&self, result: &Arc<ProcessingResult>) {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                error!(
                    packet_id = result.packet.id(),
                    "result callback panicked"
                );
                self.stats.callback_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Hash of the complete wire bytes, header included.
fn cache_key(packet: &PacketRef) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(packet.bytes());
    hasher.finish()
}
