//! Process-local (L1) tier backed by `moka`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Cache, CacheValue};
use crate::error::CacheResult;
use crate::setting::{ExpireMode, LocalTierSetting};
use crate::stats::CacheStats;
use crate::value::ValueBox;

/// Bounded in-memory tier.
///
/// Only present values are kept: an empty result is never mirrored locally,
/// so `put(ValueBox::Empty)` is a no-op and a local hit always carries a value.
pub struct LocalTier<V: CacheValue> {
    name: String,
    entries: moka::future::Cache<String, V>,
    stats: Arc<CacheStats>,
}

impl<V: CacheValue> LocalTier<V> {
    pub fn new(name: &str, setting: &LocalTierSetting, stats: Arc<CacheStats>) -> Self {
        let builder = moka::future::Cache::builder()
            .initial_capacity(setting.initial_capacity)
            .max_capacity(setting.max_capacity);
        let entries = match setting.expire_mode {
            ExpireMode::Write => builder.time_to_live(setting.expire_time),
            ExpireMode::Access => builder.time_to_idle(setting.expire_time),
        }
        .build();

        Self {
            name: name.to_string(),
            entries,
            stats,
        }
    }

    /// Plain lookup, also used internally by the layering read path.
    pub async fn lookup(&self, key: &str) -> Option<V> {
        self.stats.local.record_request();
        let hit = self.entries.get(key).await;
        if hit.is_none() {
            self.stats.local.record_miss();
        }
        hit
    }

    pub async fn insert(&self, key: &str, value: V) {
        self.entries.insert(key.to_string(), value).await;
    }

    pub async fn remove(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    pub fn remove_all(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[async_trait]
impl<V: CacheValue> Cache<V> for LocalTier<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> CacheResult<Option<ValueBox<V>>> {
        Ok(self.lookup(key).await.map(ValueBox::Present))
    }

    async fn put(&self, key: &str, value: ValueBox<V>) -> CacheResult<()> {
        match value {
            ValueBox::Present(v) => self.insert(key, v).await,
            ValueBox::Empty => {
                tracing::trace!(cache = %self.name, key = %key, "empty value not cached locally");
            }
        }
        Ok(())
    }

    async fn evict(&self, key: &str) -> CacheResult<()> {
        self.remove(key).await;
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.remove_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tier(expire: Duration, mode: ExpireMode) -> LocalTier<String> {
        let setting = LocalTierSetting::new(expire).with_expire_mode(mode);
        LocalTier::new("user", &setting, Arc::new(CacheStats::default()))
    }

    #[tokio::test]
    async fn test_put_get_evict() {
        let local = tier(Duration::from_secs(60), ExpireMode::Write);
        local
            .put("1", ValueBox::Present("alice".to_string()))
            .await
            .unwrap();
        assert_eq!(
            local.get("1").await.unwrap(),
            Some(ValueBox::Present("alice".to_string()))
        );

        local.evict("1").await.unwrap();
        assert_eq!(local.get("1").await.unwrap(), None);
        // Evicting a missing key is a no-op.
        local.evict("1").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_value_is_dropped() {
        let local = tier(Duration::from_secs(60), ExpireMode::Write);
        local.put("1", ValueBox::Empty).await.unwrap();
        assert_eq!(local.get("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let local = tier(Duration::from_secs(60), ExpireMode::Write);
        local.insert("1", "a".to_string()).await;
        local.insert("2", "b".to_string()).await;
        local.clear().await.unwrap();
        assert_eq!(local.lookup("1").await, None);
        assert_eq!(local.lookup("2").await, None);
    }

    #[tokio::test]
    async fn test_write_expiry() {
        let local = tier(Duration::from_millis(50), ExpireMode::Write);
        local.insert("1", "a".to_string()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(local.lookup("1").await, None);
    }

    #[tokio::test]
    async fn test_counters() {
        let stats = Arc::new(CacheStats::default());
        let local = LocalTier::new(
            "user",
            &LocalTierSetting::new(Duration::from_secs(60)),
            stats.clone(),
        );
        local.insert("1", 1u32).await;
        local.lookup("1").await;
        local.lookup("2").await;
        assert_eq!(stats.local.requests(), 2);
        assert_eq!(stats.local.misses(), 1);
    }
}
