//! Cache statistics.
//!
//! Each cache instance accumulates counters in memory ([`CacheStats`] plus a
//! [`TierStats`] per tier). The [`StatsAggregator`] periodically drains them
//! and folds the drained deltas into one durable [`CacheStatsRecord`] per
//! `cache name + fingerprint` in the distributed store.

mod aggregator;

pub use aggregator::{AggregatorOptions, StatsAggregator};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::setting::LayeringCacheSetting;

/// Request and miss counters of one tier.
#[derive(Debug, Default)]
pub struct TierStats {
    requests: AtomicU64,
    misses: AtomicU64,
}

impl TierStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get-and-reset both counters.
    pub fn drain(&self) -> (u64, u64) {
        (
            self.requests.swap(0, Ordering::Relaxed),
            self.misses.swap(0, Ordering::Relaxed),
        )
    }

    fn restore(&self, requests: u64, misses: u64) {
        self.requests.fetch_add(requests, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
    }
}

/// Counters of one layering cache instance.
#[derive(Debug, Default)]
pub struct CacheStats {
    requests: AtomicU64,
    loads: AtomicU64,
    load_time_ms: AtomicU64,
    pub local: TierStats,
    pub remote: TierStats,
}

impl CacheStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one loader invocation and how long it took.
    pub fn record_load(&self, elapsed: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            request_count: self.requests.load(Ordering::Relaxed),
            miss_count: self.loads.load(Ordering::Relaxed),
            total_load_time_ms: self.load_time_ms.load(Ordering::Relaxed),
            local_request_count: self.local.requests(),
            local_miss_count: self.local.misses(),
            remote_request_count: self.remote.requests(),
            remote_miss_count: self.remote.misses(),
        }
    }

    /// Get-and-reset every counter.
    pub fn drain(&self) -> StatsSnapshot {
        let (local_request_count, local_miss_count) = self.local.drain();
        let (remote_request_count, remote_miss_count) = self.remote.drain();
        StatsSnapshot {
            request_count: self.requests.swap(0, Ordering::Relaxed),
            miss_count: self.loads.swap(0, Ordering::Relaxed),
            total_load_time_ms: self.load_time_ms.swap(0, Ordering::Relaxed),
            local_request_count,
            local_miss_count,
            remote_request_count,
            remote_miss_count,
        }
    }

    /// Add a previously drained snapshot back, e.g. after a failed merge.
    pub fn restore(&self, snapshot: &StatsSnapshot) {
        self.requests
            .fetch_add(snapshot.request_count, Ordering::Relaxed);
        self.loads.fetch_add(snapshot.miss_count, Ordering::Relaxed);
        self.load_time_ms
            .fetch_add(snapshot.total_load_time_ms, Ordering::Relaxed);
        self.local
            .restore(snapshot.local_request_count, snapshot.local_miss_count);
        self.remote
            .restore(snapshot.remote_request_count, snapshot.remote_miss_count);
    }
}

/// Point-in-time copy of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub request_count: u64,
    /// Loader invocations.
    pub miss_count: u64,
    pub total_load_time_ms: u64,
    pub local_request_count: u64,
    pub local_miss_count: u64,
    pub remote_request_count: u64,
    pub remote_miss_count: u64,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Durable, merged statistics of one logical cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatsRecord {
    pub cache_name: String,
    pub fingerprint: String,
    pub description: String,
    pub setting: Option<LayeringCacheSetting>,
    pub request_count: u64,
    pub miss_count: u64,
    pub total_load_time_ms: u64,
    /// Percentage in `[0, 100]`.
    pub hit_rate: f64,
    pub local_request_count: u64,
    pub local_miss_count: u64,
    pub remote_request_count: u64,
    pub remote_miss_count: u64,
    /// Unix milliseconds of the last merge.
    pub updated_at_ms: i64,
}

impl CacheStatsRecord {
    pub fn new(cache_name: &str, setting: &LayeringCacheSetting) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            fingerprint: setting.fingerprint(),
            description: setting.description.clone(),
            setting: Some(setting.clone()),
            ..Self::default()
        }
    }

    /// Fold a drained snapshot into the record and recompute the hit rate.
    pub fn merge(&mut self, delta: &StatsSnapshot) {
        self.request_count += delta.request_count;
        self.miss_count += delta.miss_count;
        self.total_load_time_ms += delta.total_load_time_ms;
        self.local_request_count += delta.local_request_count;
        self.local_miss_count += delta.local_miss_count;
        self.remote_request_count += delta.remote_request_count;
        self.remote_miss_count += delta.remote_miss_count;
        self.hit_rate = hit_rate(self.request_count, self.miss_count);
        self.updated_at_ms = chrono::Utc::now().timestamp_millis();
    }

    /// Zero every counter, keeping identity and settings.
    pub fn reset(&mut self) {
        *self = Self {
            cache_name: std::mem::take(&mut self.cache_name),
            fingerprint: std::mem::take(&mut self.fingerprint),
            description: std::mem::take(&mut self.description),
            setting: self.setting.take(),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
            ..Self::default()
        };
    }
}

/// `(requests - misses) / requests * 100`, or 0 without requests.
pub fn hit_rate(requests: u64, misses: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        requests.saturating_sub(misses) as f64 / requests as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets_counters() {
        let stats = CacheStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_load(Duration::from_millis(7));
        stats.local.record_request();
        stats.local.record_miss();
        stats.remote.record_request();

        let drained = stats.drain();
        assert_eq!(drained.request_count, 2);
        assert_eq!(drained.miss_count, 1);
        assert_eq!(drained.total_load_time_ms, 7);
        assert_eq!(drained.local_miss_count, 1);
        assert_eq!(drained.remote_request_count, 1);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_restore_adds_back() {
        let stats = CacheStats::default();
        stats.record_request();
        let drained = stats.drain();
        stats.record_request();
        stats.restore(&drained);
        assert_eq!(stats.snapshot().request_count, 2);
    }

    #[test]
    fn test_merge_accumulates_and_computes_hit_rate() {
        let mut record = CacheStatsRecord::default();
        let delta = StatsSnapshot {
            request_count: 10,
            miss_count: 3,
            ..Default::default()
        };
        record.merge(&delta);
        record.merge(&delta);
        assert_eq!(record.request_count, 20);
        assert_eq!(record.miss_count, 6);
        assert!((record.hit_rate - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate_without_requests() {
        assert_eq!(hit_rate(0, 0), 0.0);
        assert!((hit_rate(4, 1) - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut record = CacheStatsRecord {
            cache_name: "user".into(),
            fingerprint: "1-2".into(),
            request_count: 5,
            hit_rate: 40.0,
            ..Default::default()
        };
        record.reset();
        assert_eq!(record.cache_name, "user");
        assert_eq!(record.fingerprint, "1-2");
        assert_eq!(record.request_count, 0);
        assert_eq!(record.hit_rate, 0.0);
    }
}
