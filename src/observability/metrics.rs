//! Metrics collection for the resilience layer.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector for Marketing API operations
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Per-operation counters and latencies
    operations: RwLock<HashMap<String, OperationCounters>>,
    /// Retries scheduled
    retries: AtomicU64,
    /// Calls rejected by the local rate limiter
    rate_limit_rejections: AtomicU64,
    /// Idempotency cache hits
    cache_hits: AtomicU64,
    /// Idempotency cache misses
    cache_misses: AtomicU64,
    /// Entries evicted because the cache was full
    cache_evictions: AtomicU64,
    /// Entries removed by the expiry sweep
    cache_expirations: AtomicU64,
}

#[derive(Debug, Default)]
struct OperationCounters {
    attempts: AtomicU64,
    failures: AtomicU64,
    latency: LatencyHistogram,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn with_operation<R>(&self, operation: &str, f: impl FnOnce(&OperationCounters) -> R) -> R {
        if let Some(counters) = self.operations.read().get(operation) {
            return f(counters);
        }
        let mut operations = self.operations.write();
        let counters = operations.entry(operation.to_string()).or_default();
        f(counters)
    }

    /// Record the outcome of a single attempt
    pub fn record_attempt(&self, operation: &str, latency: Duration, success: bool) {
        self.with_operation(operation, |counters| {
            counters.attempts.fetch_add(1, Ordering::Relaxed);
            if !success {
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
            counters.latency.record(latency.as_millis() as u64);
        });
    }

    /// Record a scheduled retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a local rate-limit rejection
    pub fn record_rate_limit_rejection(&self) {
        self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idempotency cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record entries evicted to make room
    pub fn record_evictions(&self, count: usize) {
        self.cache_evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record entries removed by the expiry sweep
    pub fn record_expirations(&self, count: usize) {
        self.cache_expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get attempt count for an operation
    pub fn attempt_count(&self, operation: &str) -> u64 {
        self.operations
            .read()
            .get(operation)
            .map(|c| c.attempts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get failed attempt count for an operation
    pub fn failure_count(&self, operation: &str) -> u64 {
        self.operations
            .read()
            .get(operation)
            .map(|c| c.failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get retry count
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Get rate limit rejection count
    pub fn rate_limit_rejections(&self) -> u64 {
        self.rate_limit_rejections.load(Ordering::Relaxed)
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .read()
            .iter()
            .map(|(name, counters)| {
                (
                    name.clone(),
                    OperationMetrics {
                        attempts: counters.attempts.load(Ordering::Relaxed),
                        failures: counters.failures.load(Ordering::Relaxed),
                        latency: counters.latency.stats(),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            operations,
            retries: self.retries.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_expirations: self.cache_expirations.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.operations.write().clear();
        self.retries.store(0, Ordering::Relaxed);
        self.rate_limit_rejections.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.cache_evictions.store(0, Ordering::Relaxed);
        self.cache_expirations.store(0, Ordering::Relaxed);
    }
}

/// Latency histogram using buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
    /// Bucket counts (0-100ms, 100-500ms, 500ms-2s, 2s-10s, 10s+)
    buckets: [AtomicU64; 5],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    /// Create a new histogram
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    /// Record a latency value
    pub fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.max.fetch_max(ms, Ordering::Relaxed);

        let bucket_idx = match ms {
            0..=100 => 0,
            101..=500 => 1,
            501..=2_000 => 2,
            2_001..=10_000 => 3,
            _ => 4,
        };
        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics
    pub fn stats(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        LatencyStats {
            count,
            max_ms: self.max.load(Ordering::Relaxed),
            avg_ms: if count > 0 { sum / count } else { 0 },
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

/// Latency statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    /// Sample count
    pub count: u64,
    /// Maximum latency
    pub max_ms: u64,
    /// Average latency
    pub avg_ms: u64,
    /// Bucket counts [0-100ms, 100-500ms, 500ms-2s, 2s-10s, 10s+]
    pub buckets: [u64; 5],
}

/// Per-operation metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMetrics {
    /// Attempts made
    pub attempts: u64,
    /// Failed attempts
    pub failures: u64,
    /// Latency stats
    pub latency: LatencyStats,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Per-operation metrics
    pub operations: HashMap<String, OperationMetrics>,
    /// Retries scheduled
    pub retries: u64,
    /// Local rate-limit rejections
    pub rate_limit_rejections: u64,
    /// Idempotency cache hits
    pub cache_hits: u64,
    /// Idempotency cache misses
    pub cache_misses: u64,
    /// Cache-full evictions
    pub cache_evictions: u64,
    /// Expiry sweep removals
    pub cache_expirations: u64,
}

/// Create a shared metrics collector
pub fn create_metrics_collector() -> Arc<MetricsCollector> {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_recording() {
        let metrics = MetricsCollector::new();

        metrics.record_attempt("campaigns.create", Duration::from_millis(50), false);
        metrics.record_attempt("campaigns.create", Duration::from_millis(70), true);

        assert_eq!(metrics.attempt_count("campaigns.create"), 2);
        assert_eq!(metrics.failure_count("campaigns.create"), 1);
        assert_eq!(metrics.attempt_count("insights.get"), 0);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = MetricsCollector::new();
        metrics.record_retry();
        metrics.record_rate_limit_rejection();
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);
        metrics.record_evictions(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.rate_limit_rejections, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_evictions, 3);

        metrics.reset();
        assert_eq!(metrics.snapshot().retries, 0);
    }

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();

        histogram.record(5);
        histogram.record(250);
        histogram.record(15_000);

        let stats = histogram.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.max_ms, 15_000);
        assert_eq!(stats.buckets, [1, 1, 0, 0, 1]);
    }
}
