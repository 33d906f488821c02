//! Metrics for the layering cache.
//!
//! Recorded through the `metrics` facade:
//! - Tier hits and misses
//! - Loader latency
//! - Applied invalidations by kind and delivery path
//!
//! No exporter is installed here; the embedding application chooses one.

use metrics::{counter, histogram};
use std::time::Duration;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "layercache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "layercache_misses_total";
    pub const LOAD_DURATION_SECONDS: &str = "layercache_load_duration_seconds";
    pub const INVALIDATIONS_TOTAL: &str = "layercache_invalidations_total";
}

/// Record a hit in the given tier (`"local"` or `"remote"`).
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a miss in both tiers.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record how long a loader ran.
pub fn record_load_duration(duration: Duration) {
    histogram!(names::LOAD_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Record an applied invalidation.
///
/// `path` is `"live"` for pub/sub delivery or `"queue"` for the durable poller.
pub fn record_invalidation(kind: &'static str, path: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "kind" => kind, "path" => path).increment(1);
}
