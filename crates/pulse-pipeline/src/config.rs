//! # Pipeline Configuration
//!
//! TOML-backed configuration for the router, dispatcher, processor, and
//! statistics engine. Every field has a default, so a partial file (or none
//! at all) yields a working pipeline.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ─── Router ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Entries per priority queue.
    pub queue_size: usize,
    /// Worker thread count; 0 = auto (`max(2, cores/2)`).
    pub worker_threads: usize,
    /// Entries popped per priority sweep.
    pub batch_size: usize,
    /// Routing latency above this logs a warning.
    pub max_latency_ms: u64,
    /// Track per-id sequences and flag regressions.
    pub maintain_order: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            queue_size: 10_000,
            worker_threads: 0,
            batch_size: 100,
            max_latency_ms: 5,
            maintain_order: false,
        }
    }
}

impl RouterConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(2)
        }
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub back_pressure_enabled: bool,
    /// Summed router queue depth above which ingress drops.
    pub back_pressure_threshold: usize,
    pub max_sources: usize,
    /// Capacity of the source→dispatcher ingest channel.
    pub ingest_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            back_pressure_enabled: true,
            back_pressure_threshold: 8_000,
            max_sources: 100,
            ingest_capacity: 8_192,
        }
    }
}

// ─── Processor ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub enable_extraction: bool,
    pub enable_transformation: bool,
    pub enable_statistics: bool,
    /// Submit work to the processor's worker pool instead of running
    /// inline on the delivering thread.
    pub parallel: bool,
    /// Worker thread count for parallel mode; 0 = auto.
    pub worker_threads: usize,
    pub cache_results: bool,
    pub max_cache_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            enable_extraction: true,
            enable_transformation: true,
            enable_statistics: true,
            parallel: true,
            worker_threads: 0,
            cache_results: false,
            max_cache_size: 1_000,
        }
    }
}

impl ProcessorConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(2)
        }
    }
}

// ─── Statistics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Keep windowed statistics for every field by default.
    pub enable_windowed: bool,
    /// Window sample-count cap.
    pub window_size: usize,
    /// Window time cap in milliseconds.
    pub time_window_ms: u64,
    /// Derived-value recompute interval.
    pub update_interval_ms: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        StatisticsConfig {
            enable_windowed: true,
            window_size: 1_000,
            time_window_ms: 60_000,
            update_interval_ms: 1_000,
        }
    }
}

// ─── Top level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub router: RouterConfig,
    pub dispatcher: DispatcherConfig,
    pub processor: ProcessorConfig,
    pub statistics: StatisticsConfig,
}

impl PipelineConfig {
    /// Load from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = PipelineConfig::default();
        assert_eq!(config.router.queue_size, 10_000);
        assert_eq!(config.router.batch_size, 100);
        assert_eq!(config.router.max_latency_ms, 5);
        assert!(!config.router.maintain_order);
        assert!(config.dispatcher.back_pressure_enabled);
        assert_eq!(config.dispatcher.back_pressure_threshold, 8_000);
        assert_eq!(config.dispatcher.max_sources, 100);
        assert!(config.processor.enable_extraction);
        assert!(!config.processor.cache_results);
        assert_eq!(config.processor.max_cache_size, 1_000);
        assert_eq!(config.statistics.window_size, 1_000);
        assert_eq!(config.statistics.time_window_ms, 60_000);
        assert_eq!(config.statistics.update_interval_ms, 1_000);
    }

    #[test]
    fn auto_worker_threads_floor_is_two() {
        let config = RouterConfig {
            worker_threads: 0,
            ..RouterConfig::default()
        };
        assert!(config.effective_worker_threads() >= 2);

        let pinned = RouterConfig {
            worker_threads: 7,
            ..RouterConfig::default()
        };
        assert_eq!(pinned.effective_worker_threads(), 7);
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let text = r#"
            [router]
            queue_size = 64
            maintain_order = true

            [dispatcher]
            back_pressure_threshold = 12
        "#;
        let config: PipelineConfig = toml::from_str(text).unwrap();
        assert_eq!(config.router.queue_size, 64);
        assert!(config.router.maintain_order);
        assert_eq!(config.router.batch_size, 100); // default retained
        assert_eq!(config.dispatcher.back_pressure_threshold, 12);
        assert_eq!(config.dispatcher.max_sources, 100);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config.router.queue_size, 10_000);
    }

    #[test]
    fn load_round_trips_through_file() {
        let path = std::env::temp_dir().join("pulse-config-test.toml");
        std::fs::write(&path, "[processor]\ncache_results = true\n").unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.processor.cache_results);
        std::fs::remove_file(&path).ok();

        assert!(PipelineConfig::load("/nonexistent/pulse.toml").is_err());
    }
}
