//! Block Cache Statistics
//!
//! Every cache instance owns its own prometheus [`Registry`], so several
//! caches in one process never share counters and dropping the cache drops
//! its metrics.

use std::fmt::Write as _;

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Collector for block cache counters and size histograms
#[derive(Clone)]
pub struct CacheStats {
    registry: Registry,
    bytes_pipelined: Histogram,
    bytes_written: Histogram,
    bytes_read: Histogram,
    hits: IntCounter,
    misses: IntCounter,
    dropped_inserts: IntCounter,
    buffer_flushes: IntCounter,
    write_failures: IntCounter,
    evicted_files: IntCounter,
    cache_bytes: IntGauge,
    cache_files: IntGauge,
}

fn size_histogram(name: &str, help: &str) -> Result<Histogram> {
    // 64B .. 64MB
    let buckets = exponential_buckets(64.0, 4.0, 11)?;
    Ok(Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?)
}

impl CacheStats {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("blockcache".to_string()), None)?;

        let stats = Self {
            bytes_pipelined: size_histogram(
                "bytes_pipelined",
                "Bytes accepted into the insert pipeline per insert",
            )?,
            bytes_written: size_histogram(
                "bytes_written",
                "Bytes written to cache files per buffer flush",
            )?,
            bytes_read: size_histogram("bytes_read", "Bytes read from cache files per lookup")?,
            hits: IntCounter::new("hits_total", "Lookups that found their key")?,
            misses: IntCounter::new("misses_total", "Lookups that did not find their key")?,
            dropped_inserts: IntCounter::new(
                "dropped_inserts_total",
                "Inserts dropped by the insert thread",
            )?,
            buffer_flushes: IntCounter::new(
                "buffer_flushes_total",
                "Write buffers flushed to disk",
            )?,
            write_failures: IntCounter::new(
                "write_failures_total",
                "Buffer writes that failed after all retries",
            )?,
            evicted_files: IntCounter::new(
                "evicted_files_total",
                "Cache files reclaimed by eviction",
            )?,
            cache_bytes: IntGauge::new("cache_bytes", "Bytes reserved in the cache")?,
            cache_files: IntGauge::new("cache_files", "Live cache files")?,
            registry,
        };

        stats.registry.register(Box::new(stats.bytes_pipelined.clone()))?;
        stats.registry.register(Box::new(stats.bytes_written.clone()))?;
        stats.registry.register(Box::new(stats.bytes_read.clone()))?;
        stats.registry.register(Box::new(stats.hits.clone()))?;
        stats.registry.register(Box::new(stats.misses.clone()))?;
        stats.registry.register(Box::new(stats.dropped_inserts.clone()))?;
        stats.registry.register(Box::new(stats.buffer_flushes.clone()))?;
        stats.registry.register(Box::new(stats.write_failures.clone()))?;
        stats.registry.register(Box::new(stats.evicted_files.clone()))?;
        stats.registry.register(Box::new(stats.cache_bytes.clone()))?;
        stats.registry.register(Box::new(stats.cache_files.clone()))?;

        Ok(stats)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_pipelined(&self, bytes: usize) {
        self.bytes_pipelined.observe(bytes as f64);
    }

    pub fn record_written(&self, bytes: usize) {
        self.bytes_written.observe(bytes as f64);
        self.buffer_flushes.inc();
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.observe(bytes as f64);
    }

    pub fn record_hit(&self) {
        self.hits.inc();
    }

    pub fn record_miss(&self) {
        self.misses.inc();
    }

    pub fn record_dropped_insert(&self) {
        self.dropped_inserts.inc();
    }

    pub fn record_write_failure(&self) {
        self.write_failures.inc();
    }

    pub fn record_eviction(&self) {
        self.evicted_files.inc();
    }

    pub fn set_cache_bytes(&self, bytes: u64) {
        self.cache_bytes.set(bytes as i64);
    }

    pub fn set_cache_files(&self, files: usize) {
        self.cache_files.set(files as i64);
    }

    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_pipelined: HistogramSnapshot::of(&self.bytes_pipelined),
            bytes_written: HistogramSnapshot::of(&self.bytes_written),
            bytes_read: HistogramSnapshot::of(&self.bytes_read),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            dropped_inserts: self.dropped_inserts.get(),
            buffer_flushes: self.buffer_flushes.get(),
            write_failures: self.write_failures.get(),
            evicted_files: self.evicted_files.get(),
            cache_bytes: self.cache_bytes.get().max(0) as u64,
            cache_files: self.cache_files.get().max(0) as u64,
        }
    }

    /// Render every metric in the prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStats")
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

/// Count and sum of a size histogram
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
}

impl HistogramSnapshot {
    fn of(histogram: &Histogram) -> Self {
        Self {
            count: histogram.get_sample_count(),
            sum: histogram.get_sample_sum(),
        }
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of the cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes_pipelined: HistogramSnapshot,
    pub bytes_written: HistogramSnapshot,
    pub bytes_read: HistogramSnapshot,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub dropped_inserts: u64,
    pub buffer_flushes: u64,
    pub write_failures: u64,
    pub evicted_files: u64,
    pub cache_bytes: u64,
    pub cache_files: u64,
}

impl StatsSnapshot {
    /// Human readable multi-line report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let histograms = [
            ("bytes_pipelined", &self.bytes_pipelined),
            ("bytes_written", &self.bytes_written),
            ("bytes_read", &self.bytes_read),
        ];
        for (name, h) in histograms {
            let _ = writeln!(
                out,
                "Block cache {}: count {} sum {:.0} avg {:.1}",
                name,
                h.count,
                h.sum,
                h.average()
            );
        }
        let _ = writeln!(out, "Block cache hits: {}", self.hits);
        let _ = writeln!(out, "Block cache misses: {}", self.misses);
        let _ = writeln!(out, "Block cache hit ratio: {:.3}", self.hit_ratio);
        let _ = writeln!(out, "Block cache dropped inserts: {}", self.dropped_inserts);
        let _ = writeln!(out, "Block cache buffer flushes: {}", self.buffer_flushes);
        let _ = writeln!(out, "Block cache write failures: {}", self.write_failures);
        let _ = writeln!(out, "Block cache evicted files: {}", self.evicted_files);
        let _ = writeln!(
            out,
            "Block cache size: {} bytes in {} files",
            self.cache_bytes, self.cache_files
        );
        out
    }
}
