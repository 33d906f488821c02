//! Registry of every cache in the process.
//!
//! Caches are keyed by name; several configurations of one name can coexist
//! and are told apart by their setting fingerprint. The invalidation listener
//! looks caches up by name and the stats aggregator walks all of them.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::cache::{CacheValue, LayeringCache};
use crate::error::{CacheError, CacheResult};
use crate::invalidation::InvalidationPublisher;
use crate::namespace::Namespace;
use crate::serializer::Serializer;
use crate::setting::LayeringCacheSetting;
use crate::stats::CacheStats;
use crate::store::DistributedStore;

const DEFAULT_MAX_QUEUE_LEN: u64 = 1000;

/// Type-erased view of a registered cache.
#[async_trait]
pub trait ManagedCache: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn setting(&self) -> &LayeringCacheSetting;

    fn stats(&self) -> &Arc<CacheStats>;

    /// Drop `key` from the local tier without touching the remote tier.
    async fn evict_local(&self, key: &str);

    /// Drop every local entry without touching the remote tier.
    fn clear_local(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Process-wide cache registry. Cloning is cheap.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Arc<dyn DistributedStore>,
    namespace: Namespace,
    serializer: Serializer,
    publisher: Arc<InvalidationPublisher>,
    caches: DashMap<String, Vec<Arc<dyn ManagedCache>>>,
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
    store: Arc<dyn DistributedStore>,
    namespace: Namespace,
    serializer: Serializer,
    max_queue_len: u64,
}

impl CacheManagerBuilder {
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Bound of the durable invalidation queue.
    pub fn max_queue_len(mut self, len: u64) -> Self {
        self.max_queue_len = len;
        self
    }

    pub fn build(self) -> CacheManager {
        let origin = Uuid::new_v4();
        let publisher = Arc::new(InvalidationPublisher::new(
            self.store.clone(),
            &self.namespace,
            origin,
            self.max_queue_len,
        ));
        tracing::debug!(namespace = %self.namespace.scope(), %origin, "cache manager created");

        CacheManager {
            inner: Arc::new(ManagerInner {
                store: self.store,
                namespace: self.namespace,
                serializer: self.serializer,
                publisher,
                caches: DashMap::new(),
            }),
        }
    }
}

impl CacheManager {
    pub fn builder(store: Arc<dyn DistributedStore>) -> CacheManagerBuilder {
        CacheManagerBuilder {
            store,
            namespace: Namespace::default(),
            serializer: Serializer::default(),
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
        }
    }

    pub fn store(&self) -> &Arc<dyn DistributedStore> {
        &self.inner.store
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn serializer(&self) -> Serializer {
        self.inner.serializer
    }

    /// Identity stamped on every invalidation this process publishes.
    pub fn origin(&self) -> Uuid {
        self.inner.publisher.origin()
    }

    pub fn publisher(&self) -> &Arc<InvalidationPublisher> {
        &self.inner.publisher
    }

    /// Return the cache registered for `(name, setting.fingerprint())`,
    /// creating it on first use.
    ///
    /// Fails with [`CacheError::Config`] if that slot already holds a cache
    /// of a different value type, or if `setting` is invalid.
    pub fn get_or_create<V: CacheValue>(
        &self,
        name: &str,
        setting: LayeringCacheSetting,
    ) -> CacheResult<LayeringCache<V>> {
        let fingerprint = setting.fingerprint();
        let mut slot = self.inner.caches.entry(name.to_string()).or_default();

        if let Some(existing) = slot
            .iter()
            .find(|c| c.setting().fingerprint() == fingerprint)
        {
            return existing
                .as_any()
                .downcast_ref::<LayeringCache<V>>()
                .cloned()
                .ok_or_else(|| {
                    CacheError::config(format!(
                        "cache '{name}' ({fingerprint}) is registered with a different value type"
                    ))
                });
        }

        let cache = LayeringCache::<V>::new(
            name,
            setting,
            self.inner.store.clone(),
            &self.inner.namespace,
            self.inner.serializer,
            self.inner.publisher.clone(),
        )?;
        slot.push(Arc::new(cache.clone()));
        tracing::info!(cache = %name, %fingerprint, "cache registered");
        Ok(cache)
    }

    /// Every configuration registered under `name`.
    pub fn caches_named(&self, name: &str) -> Vec<Arc<dyn ManagedCache>> {
        self.inner
            .caches
            .get(name)
            .map(|slot| slot.value().clone())
            .unwrap_or_default()
    }

    pub fn all_caches(&self) -> Vec<Arc<dyn ManagedCache>> {
        self.inner
            .caches
            .iter()
            .flat_map(|slot| slot.value().clone())
            .collect()
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Clear the local tier of every registered cache.
    pub fn clear_all_local(&self) {
        for cache in self.all_caches() {
            cache.clear_local();
        }
    }
}
