//! # Field Statistics
//!
//! Incremental per-field summaries updated atomically on every sample, with
//! derived values (mean/variance/stddev/range) recomputed on a rate-limited
//! tick instead of per sample. Optional windowed statistics keep a deque
//! bounded by both count and wall-time and recompute on each append.
//!
//! Non-numeric samples are skipped silently and do not increment counts.

use crate::config::StatisticsConfig;
use crate::extract::ExtractionMap;
use crate::value::FieldValue;
use pulse_wire::clock::TimestampClock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

// ─── Atomic f64 helpers ─────────────────────────────────────────────────────
//
// Counter updates are relaxed; min/max use acquire/release so snapshot
// readers observe values consistent with the counters they pair with.

fn f64_load(cell: &AtomicU64, order: Ordering) -> f64 {
    f64::from_bits(cell.load(order))
}

fn f64_store(cell: &AtomicU64, value: f64, order: Ordering) {
    cell.store(value.to_bits(), order);
}

fn f64_add(cell: &AtomicU64, delta: f64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        Some((f64::from_bits(bits) + delta).to_bits())
    });
}

fn f64_min(cell: &AtomicU64, sample: f64) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        (sample < f64::from_bits(bits)).then(|| sample.to_bits())
    });
}

fn f64_max(cell: &AtomicU64, sample: f64) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        (sample > f64::from_bits(bits)).then(|| sample.to_bits())
    });
}

// ─── Per-field state ────────────────────────────────────────────────────────

#[derive(Debug)]
struct FieldStats {
    count: AtomicU64,
    sum: AtomicU64,
    sum_sq: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    current: AtomicU64,
    previous: AtomicU64,
    // Derived, refreshed on the periodic tick.
    mean: AtomicU64,
    variance: AtomicU64,
    stddev: AtomicU64,
    range: AtomicU64,
    // Instantaneous inverse inter-arrival rate.
    rate_hz: AtomicU64,
    last_update_ns: AtomicU64,
}

impl FieldStats {
    fn new() -> Self {
        FieldStats {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0f64.to_bits()),
            sum_sq: AtomicU64::new(0f64.to_bits()),
            min: AtomicU64::new(f64::INFINITY.to_bits()),
            max: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            current: AtomicU64::new(0f64.to_bits()),
            previous: AtomicU64::new(0f64.to_bits()),
            mean: AtomicU64::new(0f64.to_bits()),
            variance: AtomicU64::new(0f64.to_bits()),
            stddev: AtomicU64::new(0f64.to_bits()),
            range: AtomicU64::new(0f64.to_bits()),
            rate_hz: AtomicU64::new(0f64.to_bits()),
            last_update_ns: AtomicU64::new(0),
        }
    }

    fn record(&self, value: f64, now_ns: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        f64_add(&self.sum, value);
        f64_add(&self.sum_sq, value * value);
        f64_min(&self.min, value);
        f64_max(&self.max, value);

        let prev = self.current.swap(value.to_bits(), Ordering::Relaxed);
        self.previous.store(prev, Ordering::Relaxed);

        let last = self.last_update_ns.swap(now_ns, Ordering::Relaxed);
        if last > 0 && now_ns > last {
            f64_store(
                &self.rate_hz,
                1e9 / (now_ns - last) as f64,
                Ordering::Relaxed,
            );
        }
    }

    fn recompute_derived(&self) {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return;
        }
        let sum = f64_load(&self.sum, Ordering::Acquire);
        let sum_sq = f64_load(&self.sum_sq, Ordering::Acquire);
        let mean = sum / count as f64;
        f64_store(&self.mean, mean, Ordering::Release);

        let variance = if count > 1 {
            ((sum_sq - count as f64 * mean * mean) / (count - 1) as f64).max(0.0)
        } else {
            0.0
        };
        f64_store(&self.variance, variance, Ordering::Release);
        f64_store(&self.stddev, variance.sqrt(), Ordering::Release);

        let range = f64_load(&self.max, Ordering::Acquire) - f64_load(&self.min, Ordering::Acquire);
        f64_store(&self.range, range, Ordering::Release);
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        for cell in [
            &self.sum,
            &self.sum_sq,
            &self.current,
            &self.previous,
            &self.mean,
            &self.variance,
            &self.stddev,
            &self.range,
            &self.rate_hz,
        ] {
            f64_store(cell, 0.0, Ordering::Relaxed);
        }
        f64_store(&self.min, f64::INFINITY, Ordering::Relaxed);
        f64_store(&self.max, f64::NEG_INFINITY, Ordering::Relaxed);
        self.last_update_ns.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of one field's summaries.
#[derive(Debug, Clone, Serialize)]
pub struct FieldStatsSnapshot {
    pub count: u64,
    pub sum: f64,
    pub current: f64,
    pub previous: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
    pub range: f64,
    pub rate_hz: f64,
    pub last_update_ns: u64,
}

// ─── Windowed state ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct WindowState {
    samples: VecDeque<(f64, u64)>,
    max_len: usize,
    window_ns: u64,
    mean: f64,
    min: f64,
    max: f64,
    stddev: f64,
    median: f64,
}

impl WindowState {
    fn new(max_len: usize, window_ns: u64) -> Self {
        WindowState {
            samples: VecDeque::new(),
            max_len,
            window_ns,
            mean: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            stddev: 0.0,
            median: 0.0,
        }
    }

    fn push(&mut self, value: f64, now_ns: u64) {
        self.samples.push_back((value, now_ns));
        while self.samples.len() > self.max_len {
            self.samples.pop_front();
        }
        let cutoff = now_ns.saturating_sub(self.window_ns);
        while self
            .samples
            .front()
            .is_some_and(|&(_, ts)| ts < cutoff)
        {
            self.samples.pop_front();
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.samples.is_empty() {
            return;
        }
        let n = self.samples.len() as f64;
        let mut sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        for &(v, _) in &self.samples {
            sum += v;
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.mean = sum / n;

        let mut var = 0.0;
        for &(v, _) in &self.samples {
            let d = v - self.mean;
            var += d * d;
        }
        self.stddev = (var / n).sqrt();

        let mut sorted: Vec<f64> = self.samples.iter().map(|&(v, _)| v).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        self.median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
    }

    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().map(|&(v, _)| v).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = idx.floor() as usize;
        let hi = idx.ceil() as usize;
        if lo == hi {
            Some(sorted[lo])
        } else {
            let weight = idx - lo as f64;
            Some(sorted[lo] * (1.0 - weight) + sorted[hi] * weight)
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.mean = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
        self.stddev = 0.0;
        self.median = 0.0;
    }
}

/// Point-in-time copy of one field's window summaries.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub len: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub median: f64,
}

// ─── Engine ─────────────────────────────────────────────────────────────────

struct FieldEntry {
    stats: FieldStats,
    window: Mutex<Option<WindowState>>,
}

/// Per-field incremental and windowed statistics.
pub struct StatisticsEngine {
    config: StatisticsConfig,
    fields: RwLock<HashMap<String, Arc<FieldEntry>>>,
    clock: TimestampClock,
    total_samples: AtomicU64,
    last_recompute_ns: AtomicU64,
}

impl StatisticsEngine {
    pub fn new(config: StatisticsConfig) -> Self {
        StatisticsEngine {
            config,
            fields: RwLock::new(HashMap::new()),
            clock: TimestampClock::new(),
            total_samples: AtomicU64::new(0),
            last_recompute_ns: AtomicU64::new(0),
        }
    }

    /// Feed one sample. Values that do not coerce to a finite number are
    /// skipped without incrementing any counter.
    pub fn update(&self, path: &str, value: &FieldValue) {
        let Some(numeric) = value.coerce_f64() else {
            return;
        };
        if numeric.is_nan() {
            return;
        }

        let entry = self.entry(path);
        let now_ns = self.clock.now_ns();
        entry.stats.record(numeric, now_ns);

        let mut window = entry.window.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = window.as_mut() {
            state.push(numeric, now_ns);
        }
        drop(window);

        self.total_samples.fetch_add(1, Ordering::Relaxed);
        self.maybe_recompute(now_ns);
    }

    /// Feed every successfully extracted field of a result map.
    pub fn update_map(&self, extraction: &ExtractionMap) {
        for (path, result) in extraction {
            if let Ok(value) = result {
                self.update(path, value);
            }
        }
    }

    /// Enable or disable windowed statistics for one path, overriding the
    /// configured default. Disabling discards the window.
    pub fn set_windowed(&self, path: &str, enabled: bool) {
        let entry = self.entry(path);
        let mut window = entry.window.lock().unwrap_or_else(|e| e.into_inner());
        if enabled && window.is_none() {
            *window = Some(WindowState::new(
                self.config.window_size,
                self.config.time_window_ms * 1_000_000,
            ));
        } else if !enabled {
            *window = None;
        }
    }

    pub fn snapshot(&self, path: &str) -> Option<FieldStatsSnapshot> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        let entry = fields.get(path)?;
        let s = &entry.stats;
        Some(FieldStatsSnapshot {
            count: s.count.load(Ordering::Acquire),
            sum: f64_load(&s.sum, Ordering::Acquire),
            current: f64_load(&s.current, Ordering::Acquire),
            previous: f64_load(&s.previous, Ordering::Acquire),
            min: f64_load(&s.min, Ordering::Acquire),
            max: f64_load(&s.max, Ordering::Acquire),
            mean: f64_load(&s.mean, Ordering::Acquire),
            variance: f64_load(&s.variance, Ordering::Acquire),
            stddev: f64_load(&s.stddev, Ordering::Acquire),
            range: f64_load(&s.range, Ordering::Acquire),
            rate_hz: f64_load(&s.rate_hz, Ordering::Acquire),
            last_update_ns: s.last_update_ns.load(Ordering::Acquire),
        })
    }

    pub fn window_snapshot(&self, path: &str) -> Option<WindowSnapshot> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        let entry = fields.get(path)?;
        let window = entry.window.lock().unwrap_or_else(|e| e.into_inner());
        window.as_ref().map(|w| WindowSnapshot {
            len: w.samples.len(),
            mean: w.mean,
            min: w.min,
            max: w.max,
            stddev: w.stddev,
            median: w.median,
        })
    }

    /// Percentile over the current window, linearly interpolated.
    pub fn percentile(&self, path: &str, p: f64) -> Option<f64> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        let entry = fields.get(path)?;
        let window = entry.window.lock().unwrap_or_else(|e| e.into_inner());
        window.as_ref().and_then(|w| w.percentile(p))
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(Ordering::Relaxed)
    }

    pub fn reset(&self, path: &str) {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = fields.get(path) {
            entry.stats.reset();
            if let Some(w) = entry
                .window
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_mut()
            {
                w.clear();
            }
        }
    }

    pub fn reset_all(&self) {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        for entry in fields.values() {
            entry.stats.reset();
            if let Some(w) = entry
                .window
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_mut()
            {
                w.clear();
            }
        }
        self.total_samples.store(0, Ordering::Relaxed);
    }

    /// Force the periodic derived-value recompute immediately.
    pub fn recompute_now(&self) {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        for entry in fields.values() {
            entry.stats.recompute_derived();
        }
    }

    fn entry(&self, path: &str) -> Arc<FieldEntry> {
        {
            let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = fields.get(path) {
                return Arc::clone(entry);
            }
        }
        let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(fields.entry(path.to_owned()).or_insert_with(|| {
            let window = if self.config.enable_windowed {
                Some(WindowState::new(
                    self.config.window_size,
                    self.config.time_window_ms * 1_000_000,
                ))
            } else {
                None
            };
            Arc::new(FieldEntry {
                stats: FieldStats::new(),
                window: Mutex::new(window),
            })
        }))
    }

    /// Claim the periodic tick and refresh derived values for all fields.
    /// Runs inline on the updating thread, rate-limited by the configured
    /// interval.
    fn maybe_recompute(&self, now_ns: u64) {
        let interval_ns = self.config.update_interval_ms * 1_000_000;
        let last = self.last_recompute_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(last) < interval_ns {
            return;
        }
        if self
            .last_recompute_ns
            .compare_exchange(last, now_ns, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.recompute_now();
        }
    }
}
