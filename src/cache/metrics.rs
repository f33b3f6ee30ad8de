//! Cache Metrics Collection
//!
//! Monotonic counters and smoothed timings for the corpus cache, with a
//! Prometheus text rendering for scraping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Metric name prefix
pub const METRIC_PREFIX: &str = "corpus_cache";

/// EMA smoothing factor for timings
const EMA_ALPHA: f64 = 0.1;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    saves: AtomicU64,
    errors: AtomicU64,
    integrity_failures: AtomicU64,
    evictions: AtomicU64,
    remote_invalidations: AtomicU64,

    // Timings in microseconds, exponential moving average
    compression_us: AtomicU64,
    decompression_us: AtomicU64,
    load_us: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save(&self) {
        self.saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Integrity failures also count as errors
    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error();
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_remote_invalidation(&self) {
        self.remote_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self, duration: Duration) {
        update_ema(&self.compression_us, duration);
    }

    pub fn record_decompression(&self, duration: Duration) {
        update_ema(&self.decompression_us, duration);
    }

    pub fn record_load(&self, duration: Duration) {
        update_ema(&self.load_us, duration);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
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

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            saves: self.saves(),
            errors: self.errors(),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            remote_invalidations: self.remote_invalidations.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            compression_time: Duration::from_micros(self.compression_us.load(Ordering::Relaxed)),
            decompression_time: Duration::from_micros(
                self.decompression_us.load(Ordering::Relaxed),
            ),
            load_time: Duration::from_micros(self.load_us.load(Ordering::Relaxed)),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.saves,
            &self.errors,
            &self.integrity_failures,
            &self.evictions,
            &self.remote_invalidations,
            &self.compression_us,
            &self.decompression_us,
            &self.load_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn update_ema(target: &AtomicU64, duration: Duration) {
    let sample = duration.as_micros() as u64;
    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            sample
        } else {
            ((1.0 - EMA_ALPHA) * current as f64 + EMA_ALPHA * sample as f64) as u64
        };
        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Point-in-time copy of the collector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub errors: u64,
    pub integrity_failures: u64,
    pub evictions: u64,
    pub remote_invalidations: u64,
    pub hit_ratio: f64,
    pub compression_time: Duration,
    pub decompression_time: Duration,
    pub load_time: Duration,
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format
    pub fn encode_prometheus(&self) -> Result<String> {
        let registry = Registry::new_custom(Some(METRIC_PREFIX.to_string()), None)
            .map_err(prometheus_error)?;

        let counters = [
            ("hits_total", "Loads served from the cache", self.hits),
            ("misses_total", "Loads that found no usable entry", self.misses),
            ("saves_total", "Entries written", self.saves),
            ("errors_total", "Failures degraded to a miss or dropped save", self.errors),
            (
                "integrity_failures_total",
                "Entries deleted after failing validation",
                self.integrity_failures,
            ),
            ("evictions_total", "Entries removed to free space", self.evictions),
            (
                "remote_invalidations_total",
                "Invalidations received from sibling processes",
                self.remote_invalidations,
            ),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help).map_err(prometheus_error)?;
            counter.inc_by(value);
            registry
                .register(Box::new(counter))
                .map_err(prometheus_error)?;
        }

        let gauges = [
            ("hit_ratio", "Hits over hits plus misses", self.hit_ratio),
            (
                "compression_seconds",
                "Smoothed compression time",
                self.compression_time.as_secs_f64(),
            ),
            (
                "decompression_seconds",
                "Smoothed decompression time",
                self.decompression_time.as_secs_f64(),
            ),
            ("load_seconds", "Smoothed load time", self.load_time.as_secs_f64()),
        ];
        for (name, help, value) in gauges {
            let gauge = Gauge::new(name, help).map_err(prometheus_error)?;
            gauge.set(value);
            registry.register(Box::new(gauge)).map_err(prometheus_error)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
