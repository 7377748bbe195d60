//! Process-wide counters and latency tracking surfaced by `/health`.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Upper bounds (ms) for the pull-latency histogram buckets.
const LATENCY_BUCKET_BOUNDS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

#[derive(Default)]
pub struct Metrics {
    pub upstream_unavailable: AtomicU64,
    pub upstream_rejected: AtomicU64,
    pub upstream_malformed: AtomicU64,
    pub rate_stalled: AtomicU64,
    pub late_ticks_dropped: AtomicU64,
    pub queue_ttl_dropped: AtomicU64,
    pub queue_full_dropped: AtomicU64,
    pub queue_memory_dropped: AtomicU64,
    pub slow_consumers_dropped: AtomicU64,
    pub catchup_unavailable: AtomicU64,
    pub pulls_completed: AtomicU64,
    pub pulls_failed: AtomicU64,
    /// Seconds the frame aggregator lags behind the latest closed minute.
    pub frames_lag_seconds: AtomicI64,
    validation_dropped: Mutex<BTreeMap<(&'static str, &'static str), u64>>,
    latency_buckets: [AtomicU64; 12],
    latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_validation_drop(&self, kind: &'static str, reason: &'static str) {
        *self.validation_dropped.lock().entry((kind, reason)).or_insert(0) += 1;
    }

    pub fn validation_drops(&self) -> Vec<(String, u64)> {
        self.validation_dropped
            .lock()
            .iter()
            .map(|((kind, reason), count)| (format!("{kind}/{reason}"), *count))
            .collect()
    }

    pub fn record_pull_latency_ms(&self, latency_ms: u64) {
        let idx = LATENCY_BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BUCKET_BOUNDS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Bucket upper bound under which `pct` of recorded latencies fall.
    pub fn latency_percentile_ms(&self, pct: f64) -> Option<u64> {
        let total = self.latency_count.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let target = ((total as f64) * pct).ceil() as u64;
        let mut seen = 0u64;
        for (idx, bucket) in self.latency_buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return Some(
                    LATENCY_BUCKET_BOUNDS_MS
                        .get(idx)
                        .copied()
                        .unwrap_or(u64::MAX),
                );
            }
        }
        Some(u64::MAX)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            upstream_unavailable: self.upstream_unavailable.load(Ordering::Relaxed),
            upstream_rejected: self.upstream_rejected.load(Ordering::Relaxed),
            upstream_malformed: self.upstream_malformed.load(Ordering::Relaxed),
            rate_stalled: self.rate_stalled.load(Ordering::Relaxed),
            late_ticks_dropped: self.late_ticks_dropped.load(Ordering::Relaxed),
            queue_ttl_dropped: self.queue_ttl_dropped.load(Ordering::Relaxed),
            queue_full_dropped: self.queue_full_dropped.load(Ordering::Relaxed),
            queue_memory_dropped: self.queue_memory_dropped.load(Ordering::Relaxed),
            slow_consumers_dropped: self.slow_consumers_dropped.load(Ordering::Relaxed),
            catchup_unavailable: self.catchup_unavailable.load(Ordering::Relaxed),
            pulls_completed: self.pulls_completed.load(Ordering::Relaxed),
            pulls_failed: self.pulls_failed.load(Ordering::Relaxed),
            frames_lag_seconds: self.frames_lag_seconds.load(Ordering::Relaxed),
            validation_dropped: self.validation_drops(),
            pull_latency_p50_ms: self.latency_percentile_ms(0.50),
            pull_latency_p95_ms: self.latency_percentile_ms(0.95),
            pull_latency_p99_ms: self.latency_percentile_ms(0.99),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub upstream_unavailable: u64,
    pub upstream_rejected: u64,
    pub upstream_malformed: u64,
    pub rate_stalled: u64,
    pub late_ticks_dropped: u64,
    pub queue_ttl_dropped: u64,
    pub queue_full_dropped: u64,
    pub queue_memory_dropped: u64,
    pub slow_consumers_dropped: u64,
    pub catchup_unavailable: u64,
    pub pulls_completed: u64,
    pub pulls_failed: u64,
    pub frames_lag_seconds: i64,
    pub validation_dropped: Vec<(String, u64)>,
    pub pull_latency_p50_ms: Option<u64>,
    pub pull_latency_p95_ms: Option<u64>,
    pub pull_latency_p99_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_percentiles_from_buckets() {
        let m = Metrics::new();
        for _ in 0..90 {
            m.record_pull_latency_ms(40);
        }
        for _ in 0..10 {
            m.record_pull_latency_ms(900);
        }
        assert_eq!(m.latency_percentile_ms(0.50), Some(50));
        assert_eq!(m.latency_percentile_ms(0.95), Some(1000));
    }

    #[test]
    fn validation_drops_are_labeled() {
        let m = Metrics::new();
        m.record_validation_drop("odds", "non_positive_price");
        m.record_validation_drop("odds", "non_positive_price");
        m.record_validation_drop("stats", "possession_out_of_range");
        let drops = m.validation_drops();
        assert!(drops.contains(&("odds/non_positive_price".to_string(), 2)));
        assert!(drops.contains(&("stats/possession_out_of_range".to_string(), 1)));
    }
}
