//! Cache Metrics Collection
//!
//! Hit/miss and failover counters for the orchestrator. Observability only;
//! nothing here feeds back into routing decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Local tier
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,

    // Primary tier
    primary_hits: AtomicU64,
    primary_misses: AtomicU64,
    primary_errors: AtomicU64,

    // Secondary tier
    secondary_hits: AtomicU64,
    secondary_misses: AtomicU64,
    secondary_errors: AtomicU64,

    // Movement between tiers
    repopulations: AtomicU64,
    failovers: AtomicU64,

    // Writes refused because the value was a proxy
    rejected_proxies: AtomicU64,

    // Remote read latency (microseconds, exponential moving average)
    remote_read_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Local tier
    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l1_misses(&self) -> u64 {
        self.l1_misses.load(Ordering::Relaxed)
    }

    pub fn l1_hit_ratio(&self) -> f64 {
        let hits = self.l1_hits() as f64;
        let total = hits + self.l1_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Primary tier
    pub fn record_primary_hit(&self) {
        self.primary_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_primary_miss(&self) {
        self.primary_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_primary_error(&self) {
        self.primary_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Secondary tier
    pub fn record_secondary_hit(&self) {
        self.secondary_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_secondary_miss(&self) {
        self.secondary_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_secondary_error(&self) {
        self.secondary_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repopulation(&self) {
        self.repopulations.fetch_add(1, Ordering::Relaxed);
    }

    /// A read was served by the secondary tier
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_proxy(&self) {
        self.rejected_proxies.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a remote read latency sample
    pub fn record_remote_read_latency(&self, latency: Duration) {
        let sample = latency.as_micros() as u64;
        // EMA with alpha = 1/8; the first sample seeds the average
        let _ = self
            .remote_read_latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                if current == 0 {
                    Some(sample)
                } else {
                    Some(current - current / 8 + sample / 8)
                }
            });
    }

    pub fn remote_read_latency(&self) -> Duration {
        Duration::from_micros(self.remote_read_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            l1_hits: self.l1_hits(),
            l1_misses: self.l1_misses(),
            l1_hit_ratio: self.l1_hit_ratio(),
            primary_hits: self.primary_hits.load(Ordering::Relaxed),
            primary_misses: self.primary_misses.load(Ordering::Relaxed),
            primary_errors: self.primary_errors.load(Ordering::Relaxed),
            secondary_hits: self.secondary_hits.load(Ordering::Relaxed),
            secondary_misses: self.secondary_misses.load(Ordering::Relaxed),
            secondary_errors: self.secondary_errors.load(Ordering::Relaxed),
            repopulations: self.repopulations.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            rejected_proxies: self.rejected_proxies.load(Ordering::Relaxed),
            remote_read_latency: self.remote_read_latency(),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_ratio: f64,

    pub primary_hits: u64,
    pub primary_misses: u64,
    pub primary_errors: u64,

    pub secondary_hits: u64,
    pub secondary_misses: u64,
    pub secondary_errors: u64,

    pub repopulations: u64,
    pub failovers: u64,
    pub rejected_proxies: u64,

    pub remote_read_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
