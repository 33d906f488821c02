//! Two-tier cache composite.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Cache, CacheValue, LocalTier, PutOutcome, RemoteTier};
use crate::error::{BoxError, CacheError, CacheResult};
use crate::invalidation::InvalidationPublisher;
use crate::lock::DistributedLock;
use crate::manager::ManagedCache;
use crate::metrics;
use crate::namespace::Namespace;
use crate::serializer::Serializer;
use crate::setting::{LayeringCacheSetting, LoadErrorPolicy};
use crate::stats::CacheStats;
use crate::store::DistributedStore;
use crate::value::ValueBox;

/// A local tier in front of a shared remote tier.
///
/// ## Read path
///
/// 1. Local tier (when enabled)
/// 2. Remote tier; a present value is mirrored locally, an empty one is not
/// 3. Loader, run under a per-key [`DistributedLock`] after re-checking the
///    remote tier, with the result written to both tiers
///
/// ## Write path
///
/// Every mutation hits the remote tier first, publishes an invalidation so
/// other processes drop their local copies, then updates this process's
/// local tier synchronously.
///
/// Cloning is cheap; clones share both tiers and the counters.
pub struct LayeringCache<V: CacheValue> {
    inner: Arc<Inner<V>>,
}

struct Inner<V: CacheValue> {
    name: String,
    fingerprint: String,
    setting: LayeringCacheSetting,
    local: Option<LocalTier<V>>,
    remote: RemoteTier<V>,
    store: Arc<dyn DistributedStore>,
    publisher: Arc<InvalidationPublisher>,
    stats: Arc<CacheStats>,
}

impl<V: CacheValue> Clone for LayeringCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> LayeringCache<V> {
    pub fn new(
        name: &str,
        setting: LayeringCacheSetting,
        store: Arc<dyn DistributedStore>,
        namespace: &Namespace,
        serializer: Serializer,
        publisher: Arc<InvalidationPublisher>,
    ) -> CacheResult<Self> {
        if name.is_empty() {
            return Err(CacheError::config("cache name must not be empty"));
        }
        setting.validate()?;

        let stats = Arc::new(CacheStats::default());
        let local = setting
            .local_enabled
            .then(|| LocalTier::new(name, &setting.local, stats.clone()));
        let remote = RemoteTier::new(
            name,
            namespace,
            &setting.remote,
            store.clone(),
            serializer,
            stats.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                fingerprint: setting.fingerprint(),
                setting,
                local,
                remote,
                store,
                publisher,
                stats,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn setting(&self) -> &LayeringCacheSetting {
        &self.inner.setting
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.inner.stats
    }

    pub fn local(&self) -> Option<&LocalTier<V>> {
        self.inner.local.as_ref()
    }

    pub fn remote(&self) -> &RemoteTier<V> {
        &self.inner.remote
    }

    /// Read `key`, computing it with `loader` when neither tier has it.
    ///
    /// Returns `Ok(None)` when the value is (or was cached as) empty.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = &self.inner;
        inner.stats.record_request();

        if let Some(value) = self.local_hit(key).await {
            return Ok(Some(value));
        }

        match inner.remote.lookup(key).await {
            Ok(Some(boxed)) => {
                tracing::debug!(cache = %inner.name, key = %key, "cache hit (remote)");
                metrics::record_cache_hit("remote");
                self.spawn_preload(key, &boxed, loader);
                self.mirror(key, &boxed).await;
                return Ok(boxed.into_option());
            }
            Ok(None) => {}
            Err(e) if e.is_backend() => {
                tracing::warn!(cache = %inner.name, key = %key, error = %e, "remote tier unavailable, loading without it");
                metrics::record_cache_miss();
                return self.load_unshared(key, loader).await;
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(cache = %inner.name, key = %key, "cache miss");
        metrics::record_cache_miss();
        self.load_locked(key, loader).await
    }

    /// Re-run `loader` and publish only if the value actually changed.
    ///
    /// An unchanged value just has its remote TTL extended.
    pub async fn refresh<F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = &self.inner;
        let previous = match inner.remote.lookup(key).await {
            Ok(previous) => previous,
            Err(e) if e.is_backend() => {
                tracing::warn!(cache = %inner.name, key = %key, error = %e, "remote read failed during refresh");
                None
            }
            Err(e) => return Err(e),
        };

        let (result, elapsed) = self.run_loader(key, loader).await;
        metrics::record_load_duration(elapsed);
        let fresh = match result {
            Ok(value) => ValueBox::from(value),
            Err(err @ CacheError::LoadTimeout { .. }) => return Err(err),
            Err(err) => match inner.setting.load.error_policy {
                LoadErrorPolicy::Propagate => return Err(err),
                LoadErrorPolicy::CacheEmpty => {
                    tracing::warn!(cache = %inner.name, key = %key, error = %err, "refresh loader failed, caching empty");
                    ValueBox::Empty
                }
                LoadErrorPolicy::ReturnEmpty => {
                    tracing::warn!(cache = %inner.name, key = %key, error = %err, "refresh loader failed, keeping cached value");
                    return Ok(None);
                }
            },
        };

        if previous.as_ref() == Some(&fresh) {
            if let Err(e) = inner.remote.touch(key, &fresh).await {
                tracing::warn!(cache = %inner.name, key = %key, error = %e, "failed to extend remote ttl");
            }
            tracing::trace!(cache = %inner.name, key = %key, "refresh produced an unchanged value");
            return Ok(fresh.into_option());
        }

        self.write(key, fresh).await
    }

    /// Write `value` only if the remote tier has nothing for `key`.
    ///
    /// Returns the value that was already cached, if any.
    pub async fn put_if_absent(
        &self,
        key: &str,
        value: ValueBox<V>,
    ) -> CacheResult<Option<ValueBox<V>>> {
        let existing = self.inner.remote.put_if_absent(key, &value).await?;
        match &existing {
            Some(current) => self.mirror(key, current).await,
            None => self.mirror(key, &value).await,
        }
        Ok(existing)
    }

    /// Drop `key` from this process's local tier only.
    pub async fn evict_local(&self, key: &str) {
        if let Some(local) = &self.inner.local {
            local.remove(key).await;
        }
    }

    /// Drop every entry of this process's local tier only.
    pub fn clear_local(&self) {
        if let Some(local) = &self.inner.local {
            local.remove_all();
        }
    }

    async fn local_hit(&self, key: &str) -> Option<V> {
        let local = self.inner.local.as_ref()?;
        let value = local.lookup(key).await?;
        tracing::debug!(cache = %self.inner.name, key = %key, "cache hit (local)");
        metrics::record_cache_hit("local");
        Some(value)
    }

    async fn mirror(&self, key: &str, value: &ValueBox<V>) {
        if let (Some(local), ValueBox::Present(v)) = (&self.inner.local, value) {
            local.insert(key, v.clone()).await;
        }
    }

    async fn load_locked<F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = &self.inner;
        let mut lock = DistributedLock::new(
            inner.store.clone(),
            &inner.remote.data_key(key),
            inner.setting.load.lock_lease,
            inner.setting.load.lock_wait,
        );

        if lock.try_acquire().await {
            match inner.remote.lookup(key).await {
                Ok(Some(boxed)) => {
                    lock.release().await;
                    tracing::debug!(cache = %inner.name, key = %key, "value loaded by another holder");
                    self.mirror(key, &boxed).await;
                    return Ok(boxed.into_option());
                }
                Ok(None) => {}
                Err(e) if e.is_backend() => {
                    tracing::warn!(cache = %inner.name, key = %key, error = %e, "remote re-check failed");
                }
                Err(e) => {
                    lock.release().await;
                    return Err(e);
                }
            }
        } else {
            match inner.remote.lookup(key).await {
                Ok(Some(boxed)) => {
                    tracing::debug!(cache = %inner.name, key = %key, "value loaded by lock holder");
                    self.mirror(key, &boxed).await;
                    return Ok(boxed.into_option());
                }
                Ok(None) => {}
                Err(e) if e.is_backend() => {}
                Err(e) => return Err(e),
            }
            tracing::debug!(cache = %inner.name, key = %key, "loading without lock");
        }

        let (result, elapsed) = self.run_loader(key, loader).await;
        self.record_load(elapsed);

        match result {
            Ok(value) => {
                let boxed = ValueBox::from(value);
                let written = self.write_loaded(key, &boxed).await;
                lock.release().await;
                written?;
                Ok(boxed.into_option())
            }
            Err(err) => {
                lock.release().await;
                self.on_load_error(key, err, true).await
            }
        }
    }

    /// Loader path while the remote tier is unreachable: no lock, no writes.
    async fn load_unshared<F, Fut, E>(&self, key: &str, loader: F) -> CacheResult<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let (result, elapsed) = self.run_loader(key, loader).await;
        self.record_load(elapsed);
        match result {
            Ok(value) => Ok(value),
            Err(err) => self.on_load_error(key, err, false).await,
        }
    }

    async fn run_loader<F, Fut, E>(
        &self,
        key: &str,
        loader: F,
    ) -> (CacheResult<Option<V>>, Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let started = Instant::now();
        let load = loader();
        let result = match self.inner.setting.load.load_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, load).await {
                Ok(result) => result,
                Err(_) => {
                    return (
                        Err(CacheError::LoadTimeout {
                            key: key.to_string(),
                            timeout,
                        }),
                        started.elapsed(),
                    );
                }
            },
            None => load.await,
        };

        let result = result.map_err(|e| CacheError::Load {
            key: key.to_string(),
            source: e.into(),
        });
        (result, started.elapsed())
    }

    fn record_load(&self, elapsed: Duration) {
        self.inner.stats.record_load(elapsed);
        metrics::record_load_duration(elapsed);
    }

    async fn on_load_error(
        &self,
        key: &str,
        err: CacheError,
        remote_available: bool,
    ) -> CacheResult<Option<V>> {
        let inner = &self.inner;
        if matches!(err, CacheError::LoadTimeout { .. }) {
            tracing::warn!(cache = %inner.name, key = %key, error = %err, "loader timed out");
            return Err(err);
        }

        match inner.setting.load.error_policy {
            LoadErrorPolicy::Propagate => Err(err),
            LoadErrorPolicy::CacheEmpty => {
                tracing::warn!(cache = %inner.name, key = %key, error = %err, "loader failed, caching empty");
                if remote_available {
                    self.write_loaded(key, &ValueBox::Empty).await?;
                }
                Ok(None)
            }
            LoadErrorPolicy::ReturnEmpty => {
                tracing::warn!(cache = %inner.name, key = %key, error = %err, "loader failed, returning empty");
                Ok(None)
            }
        }
    }

    /// Store a freshly loaded value; nothing is published since no process
    /// could have held a newer copy.
    async fn write_loaded(&self, key: &str, value: &ValueBox<V>) -> CacheResult<()> {
        match self.inner.remote.store(key, value).await {
            Ok(PutOutcome::Stored) => self.mirror(key, value).await,
            Ok(PutOutcome::Evicted) => self.evict_local(key).await,
            Err(e) if e.is_backend() => {
                tracing::warn!(cache = %self.inner.name, key = %key, error = %e, "remote write failed, value served uncached");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Remote write, invalidation, then local update.
    async fn write(&self, key: &str, value: ValueBox<V>) -> CacheResult<Option<V>> {
        let inner = &self.inner;
        let outcome = match inner.remote.store(key, &value).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_backend() => {
                tracing::warn!(cache = %inner.name, key = %key, error = %e, "remote write failed");
                None
            }
            Err(e) => return Err(e),
        };

        inner
            .publisher
            .publish_evict(&inner.name, &inner.fingerprint, key)
            .await;

        match (outcome, &value) {
            (Some(PutOutcome::Stored), ValueBox::Present(_)) => self.mirror(key, &value).await,
            _ => self.evict_local(key).await,
        }
        Ok(value.into_option())
    }

    fn spawn_preload<F, Fut, E>(&self, key: &str, current: &ValueBox<V>, loader: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let Some(preload_time) = self.inner.setting.remote.preload_time else {
            return;
        };
        let cache = self.clone();
        let key = key.to_string();
        let current = current.clone();
        tokio::spawn(async move {
            cache.preload(&key, current, preload_time, loader).await;
        });
    }

    async fn preload<F, Fut, E>(
        &self,
        key: &str,
        current: ValueBox<V>,
        preload_time: Duration,
        loader: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = &self.inner;
        match inner.remote.remaining_ttl(key).await {
            Ok(Some(ttl)) if ttl <= preload_time => {}
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(cache = %inner.name, key = %key, error = %e, "preload ttl check failed");
                return;
            }
        }

        let mut lock = DistributedLock::new(
            inner.store.clone(),
            &inner.remote.data_key(key),
            inner.setting.load.lock_lease,
            Duration::ZERO,
        );
        if !lock.try_acquire().await {
            return;
        }

        if inner.setting.remote.force_refresh {
            tracing::debug!(cache = %inner.name, key = %key, "refreshing ahead of expiry");
            if let Err(e) = self.refresh(key, loader).await {
                tracing::warn!(cache = %inner.name, key = %key, error = %e, "refresh-ahead failed");
            }
        } else if let Err(e) = inner.remote.touch(key, &current).await {
            tracing::warn!(cache = %inner.name, key = %key, error = %e, "failed to extend remote ttl");
        }

        lock.release().await;
    }
}

#[async_trait]
impl<V: CacheValue> Cache<V> for LayeringCache<V> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Read without a loader: local then remote.
    async fn get(&self, key: &str) -> CacheResult<Option<ValueBox<V>>> {
        self.inner.stats.record_request();
        if let Some(value) = self.local_hit(key).await {
            return Ok(Some(ValueBox::Present(value)));
        }
        match self.inner.remote.lookup(key).await {
            Ok(Some(boxed)) => {
                metrics::record_cache_hit("remote");
                self.mirror(key, &boxed).await;
                Ok(Some(boxed))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_backend() => {
                tracing::warn!(cache = %self.inner.name, key = %key, error = %e, "remote read failed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, value: ValueBox<V>) -> CacheResult<()> {
        self.write(key, value).await.map(|_| ())
    }

    async fn evict(&self, key: &str) -> CacheResult<()> {
        let inner = &self.inner;
        if let Err(e) = inner.remote.remove(key).await {
            if !e.is_backend() {
                return Err(e);
            }
            tracing::warn!(cache = %inner.name, key = %key, error = %e, "remote evict failed");
        }
        inner
            .publisher
            .publish_evict(&inner.name, &inner.fingerprint, key)
            .await;
        self.evict_local(key).await;
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        let inner = &self.inner;
        if let Err(e) = inner.remote.remove_all().await {
            if !e.is_backend() {
                return Err(e);
            }
            tracing::warn!(cache = %inner.name, error = %e, "remote clear failed");
        }
        inner
            .publisher
            .publish_clear(&inner.name, &inner.fingerprint)
            .await;
        self.clear_local();
        Ok(())
    }
}

#[async_trait]
impl<V: CacheValue> ManagedCache for LayeringCache<V> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn setting(&self) -> &LayeringCacheSetting {
        &self.inner.setting
    }

    fn stats(&self) -> &Arc<CacheStats> {
        &self.inner.stats
    }

    async fn evict_local(&self, key: &str) {
        LayeringCache::evict_local(self, key).await;
    }

    fn clear_local(&self) {
        LayeringCache::clear_local(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::{LocalTierSetting, RemoteTierSetting};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    type LoadResult = Result<Option<String>, BoxError>;

    fn setting() -> LayeringCacheSetting {
        LayeringCacheSetting::new(
            LocalTierSetting::new(Duration::from_secs(60)),
            RemoteTierSetting::new(Duration::from_secs(120)),
        )
    }

    fn cache(memory: &MemoryStore, setting: LayeringCacheSetting) -> LayeringCache<String> {
        let store: Arc<dyn DistributedStore> = Arc::new(memory.clone());
        let namespace = Namespace::new("svc", None);
        let publisher = Arc::new(InvalidationPublisher::new(
            store.clone(),
            &namespace,
            Uuid::new_v4(),
            100,
        ));
        LayeringCache::new(
            "user",
            setting,
            store,
            &namespace,
            Serializer::default(),
            publisher,
        )
        .unwrap()
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: Option<&str>,
    ) -> impl FnOnce() -> std::future::Ready<LoadResult> + Send + 'static {
        let calls = calls.clone();
        let value = value.map(str::to_string);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    #[tokio::test]
    async fn test_load_once_then_local_hit() {
        let memory = MemoryStore::new();
        let cache = cache(&memory, setting());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let value = cache
                .get_or_load("1", counting_loader(&calls, Some("alice")))
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("alice"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = cache.stats().snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.miss_count, 1);
        assert_eq!(snapshot.local_request_count, 3);
        assert_eq!(snapshot.local_miss_count, 1);
    }

    #[tokio::test]
    async fn test_remote_hit_is_mirrored_locally() {
        let memory = MemoryStore::new();
        let writer = cache(&memory, setting());
        let reader = cache(&memory, setting());
        writer
            .put("1", ValueBox::Present("alice".to_string()))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let value = reader
            .get_or_load("1", counting_loader(&calls, Some("other")))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(reader.local().unwrap().lookup("1").await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_empty_result_cached_remotely_not_locally() {
        let memory = MemoryStore::new();
        let cache = cache(&memory, setting());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let value = cache
                .get_or_load("1", counting_loader(&calls, None))
                .await
                .unwrap();
            assert_eq!(value, None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.local().unwrap().lookup("1").await, None);
        assert_eq!(cache.remote().lookup("1").await.unwrap(), Some(ValueBox::Empty));
    }

    #[tokio::test]
    async fn test_loader_error_propagates_and_releases_lock() {
        let memory = MemoryStore::new();
        let cache = cache(&memory, setting());

        let err = cache
            .get_or_load("1", || async { Err::<Option<String>, _>("db down") })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Load { .. }));
        assert_eq!(memory.get("svc:user:1_lock").await.unwrap(), None);
        assert_eq!(cache.remote().lookup("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_policies() {
        let memory = MemoryStore::new();
        let cache_empty = cache(
            &memory,
            setting().with_error_policy(LoadErrorPolicy::CacheEmpty),
        );
        let value = cache_empty
            .get_or_load("1", || async { Err::<Option<String>, _>("boom") })
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(
            cache_empty.remote().lookup("1").await.unwrap(),
            Some(ValueBox::Empty)
        );

        let return_empty = cache(
            &memory,
            setting().with_error_policy(LoadErrorPolicy::ReturnEmpty),
        );
        let value = return_empty
            .get_or_load("2", || async { Err::<Option<String>, _>("boom") })
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(return_empty.remote().lookup("2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_loader_timeout() {
        let memory = MemoryStore::new();
        let cache = cache(
            &memory,
            setting().with_load_timeout(Duration::from_millis(20)),
        );
        let err = cache
            .get_or_load("1", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BoxError>(Some("late".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::LoadTimeout { .. }));
        assert_eq!(memory.get("svc:user:1_lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_outage_serves_loader_value() {
        let memory = MemoryStore::new();
        let cache = cache(&memory, setting());
        memory.set_available(false);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = cache
            .get_or_load("1", counting_loader(&calls, Some("alice")))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        memory.set_available(true);
        assert_eq!(cache.remote().lookup("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_empty_with_empty_disallowed_evicts_both_tiers() {
        let memory = MemoryStore::new();
        let mut s = setting();
        s.remote = s.remote.with_allow_empty(false);
        let cache = cache(&memory, s);

        cache
            .put("1", ValueBox::Present("alice".to_string()))
            .await
            .unwrap();
        cache.put("1", ValueBox::Empty).await.unwrap();

        assert_eq!(cache.local().unwrap().lookup("1").await, None);
        assert_eq!(cache.remote().lookup("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_overwrites_local_on_change() {
        let memory = MemoryStore::new();
        let cache = cache(&memory, setting());
        cache
            .put("1", ValueBox::Present("v1".to_string()))
            .await
            .unwrap();

        let value = cache
            .refresh("1", || async { Ok::<_, BoxError>(Some("v2".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v2"));
        assert_eq!(cache.local().unwrap().lookup("1").await.as_deref(), Some("v2"));
        assert_eq!(
            cache.remote().lookup("1").await.unwrap(),
            Some(ValueBox::Present("v2".to_string()))
        );
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let memory = MemoryStore::new();
        let cache = cache(&memory, setting());
        let first = cache
            .put_if_absent("1", ValueBox::Present("a".to_string()))
            .await
            .unwrap();
        assert_eq!(first, None);
        let second = cache
            .put_if_absent("1", ValueBox::Present("b".to_string()))
            .await
            .unwrap();
        assert_eq!(second, Some(ValueBox::Present("a".to_string())));
        assert_eq!(cache.local().unwrap().lookup("1").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_preload_extends_ttl_near_expiry() {
        let memory = MemoryStore::new();
        let mut s = setting();
        s.remote = RemoteTierSetting::new(Duration::from_secs(10))
            .with_preload(Duration::from_secs(9), false);
        let writer = cache(&memory, s.clone());
        let reader = cache(&memory, s.with_local_enabled(false));

        writer
            .put("1", ValueBox::Present("alice".to_string()))
            .await
            .unwrap();
        memory
            .expire("svc:user:1", Duration::from_secs(2))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        reader
            .get_or_load("1", counting_loader(&calls, Some("other")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ttl = memory.ttl("svc:user:1").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
