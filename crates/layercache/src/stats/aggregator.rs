//! Periodic merge of in-process counters into durable stats records.

use std::cmp::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::CacheStatsRecord;
use crate::error::{CacheError, CacheResult};
use crate::lock::DistributedLock;
use crate::manager::{CacheManager, ManagedCache};

const LOCK_SUFFIX: &str = "_lock";

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub period: Duration,
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub record_ttl: Duration,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            lock_lease: Duration::from_secs(5),
            lock_wait: Duration::from_millis(500),
            record_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Drains every registered cache's counters and folds them into one durable
/// record per `cache name + fingerprint`.
///
/// Each merge runs under a [`DistributedLock`] on the record key so that
/// concurrent processes never lose each other's increments.
#[derive(Clone)]
pub struct StatsAggregator {
    manager: CacheManager,
    options: AggregatorOptions,
}

impl StatsAggregator {
    pub fn new(manager: CacheManager, options: AggregatorOptions) -> Self {
        Self { manager, options }
    }

    /// Store key of the record for `cache`.
    pub fn record_key(&self, cache_name: &str, fingerprint: &str) -> String {
        format!(
            "{}{}:{}",
            self.manager.namespace().stats_prefix(),
            cache_name,
            fingerprint
        )
    }

    /// Run one aggregation pass over every registered cache.
    ///
    /// Returns how many records were written.
    pub async fn aggregate_once(&self) -> usize {
        let mut merged = 0;
        for cache in self.manager.all_caches() {
            match self.merge_cache(cache.as_ref()).await {
                Ok(true) => merged += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(cache = %cache.name(), error = %e, "stats merge failed");
                }
            }
        }
        merged
    }

    async fn merge_cache(&self, cache: &dyn ManagedCache) -> CacheResult<bool> {
        if cache.stats().snapshot().is_empty() {
            return Ok(false);
        }

        let key = self.record_key(cache.name(), &cache.setting().fingerprint());
        let mut lock = DistributedLock::new(
            self.manager.store().clone(),
            &key,
            self.options.lock_lease,
            self.options.lock_wait,
        );
        if !lock.try_acquire().await {
            tracing::debug!(cache = %cache.name(), "stats record locked elsewhere, merge skipped");
            return Ok(false);
        }

        let result = self.merge_locked(cache, &key).await;
        lock.release().await;
        result.map(|_| true)
    }

    async fn merge_locked(&self, cache: &dyn ManagedCache, key: &str) -> CacheResult<()> {
        let store = self.manager.store();
        let mut record = match store.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CacheError::serialization(format!("stats record: {e}")))?,
            None => CacheStatsRecord::new(cache.name(), cache.setting()),
        };

        let delta = cache.stats().drain();
        record.merge(&delta);

        let written = match serde_json::to_vec(&record) {
            Ok(bytes) => store
                .set(key, &bytes, Some(self.options.record_ttl))
                .await
                .map_err(CacheError::from),
            Err(e) => Err(CacheError::serialization(format!("stats record: {e}"))),
        };
        if let Err(e) = written {
            cache.stats().restore(&delta);
            return Err(e);
        }

        tracing::trace!(
            cache = %cache.name(),
            requests = record.request_count,
            hit_rate = record.hit_rate,
            "stats merged"
        );
        Ok(())
    }

    /// Every durable record, optionally restricted to cache names starting
    /// with `filter`, ordered by hit rate (highest first).
    pub async fn list_stats(&self, filter: Option<&str>) -> CacheResult<Vec<CacheStatsRecord>> {
        let store = self.manager.store();
        let keys = store
            .scan_prefix(&self.manager.namespace().stats_prefix())
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|k| !k.ends_with(LOCK_SUFFIX)) {
            let Some(bytes) = store.get(key).await? else {
                continue;
            };
            match serde_json::from_slice::<CacheStatsRecord>(&bytes) {
                Ok(record) => {
                    if filter.is_none_or(|f| record.cache_name.starts_with(f)) {
                        records.push(record);
                    }
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable stats record"),
            }
        }

        records.sort_by(|a, b| {
            b.hit_rate
                .partial_cmp(&a.hit_rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.cache_name.cmp(&b.cache_name))
        });
        Ok(records)
    }

    /// Zero every durable record of this namespace.
    pub async fn reset_stats(&self) -> CacheResult<usize> {
        let keys = self
            .manager
            .store()
            .scan_prefix(&self.manager.namespace().stats_prefix())
            .await?;
        let mut reset = 0;
        for key in keys.iter().filter(|k| !k.ends_with(LOCK_SUFFIX)) {
            if self.reset_record(key).await? {
                reset += 1;
            }
        }
        tracing::info!(reset, "stats records reset");
        Ok(reset)
    }

    /// Zero one durable record; returns `false` if it does not exist.
    pub async fn reset_record(&self, key: &str) -> CacheResult<bool> {
        let store = self.manager.store();
        let mut lock = DistributedLock::new(
            store.clone(),
            key,
            self.options.lock_lease,
            self.options.lock_wait,
        );
        let locked = lock.try_acquire().await;
        let result = self.reset_unlocked(key).await;
        if locked {
            lock.release().await;
        }
        result
    }

    async fn reset_unlocked(&self, key: &str) -> CacheResult<bool> {
        let store = self.manager.store();
        let Some(bytes) = store.get(key).await? else {
            return Ok(false);
        };
        let mut record: CacheStatsRecord = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::serialization(format!("stats record: {e}")))?;
        record.reset();
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| CacheError::serialization(format!("stats record: {e}")))?;
        store.set(key, &bytes, Some(self.options.record_ttl)).await?;
        Ok(true)
    }

    /// Run [`aggregate_once`](Self::aggregate_once) every period until shutdown.
    ///
    /// A pass already in progress completes before the task exits.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(period_secs = self.options.period.as_secs(), "stats aggregator started");
            let mut ticker = tokio::time::interval(self.options.period);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let merged = self.aggregate_once().await;
                        tracing::debug!(merged, "stats aggregation pass finished");
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            tracing::info!("stats aggregator shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator")
            .field("namespace", &self.manager.namespace().scope())
            .field("options", &self.options)
            .finish()
    }
}
