//! Shared (L2) tier stored in the distributed store.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Cache, CacheValue};
use crate::error::CacheResult;
use crate::namespace::Namespace;
use crate::serializer::Serializer;
use crate::setting::RemoteTierSetting;
use crate::stats::CacheStats;
use crate::store::DistributedStore;
use crate::value::ValueBox;

const LOCK_SUFFIX: &str = "_lock";

/// What a remote write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The value was written with its TTL.
    Stored,
    /// An empty value was not cacheable; the key was deleted instead.
    Evicted,
}

/// Remote tier of one cache.
///
/// Values are stored under `{namespace}:{cache_name}:{key}` as an encoded
/// [`ValueBox`]. Present values live for `expiration`; empty values live for
/// the magnified empty TTL.
pub struct RemoteTier<V: CacheValue> {
    name: String,
    prefix: String,
    store: Arc<dyn DistributedStore>,
    serializer: Serializer,
    setting: RemoteTierSetting,
    stats: Arc<CacheStats>,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue> RemoteTier<V> {
    pub fn new(
        name: &str,
        namespace: &Namespace,
        setting: &RemoteTierSetting,
        store: Arc<dyn DistributedStore>,
        serializer: Serializer,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            name: name.to_string(),
            prefix: namespace.data_prefix(name),
            store,
            serializer,
            setting: setting.clone(),
            stats,
            _value: PhantomData,
        }
    }

    pub fn setting(&self) -> &RemoteTierSetting {
        &self.setting
    }

    /// Full store key of `key`.
    pub fn data_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn ttl_for(&self, value: &ValueBox<V>) -> Duration {
        match value {
            ValueBox::Present(_) => self.setting.expiration,
            ValueBox::Empty => self.setting.empty_ttl(),
        }
    }

    pub async fn lookup(&self, key: &str) -> CacheResult<Option<ValueBox<V>>> {
        self.stats.remote.record_request();
        let raw = match self.store.get(&self.data_key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.remote.record_miss();
                return Err(e.into());
            }
        };
        match raw {
            Some(bytes) => Ok(Some(self.serializer.decode(&bytes)?)),
            None => {
                self.stats.remote.record_miss();
                Ok(None)
            }
        }
    }

    /// Write `value` with the TTL its kind calls for.
    pub async fn store(&self, key: &str, value: &ValueBox<V>) -> CacheResult<PutOutcome> {
        let data_key = self.data_key(key);
        if value.is_empty() && !self.setting.allow_empty {
            self.store.del(&[data_key]).await?;
            return Ok(PutOutcome::Evicted);
        }

        let bytes = self.serializer.encode(value)?;
        let ttl = self.ttl_for(value);
        self.store.set(&data_key, &bytes, Some(ttl)).await?;
        tracing::trace!(cache = %self.name, key = %key, ttl_ms = ttl.as_millis() as u64, "remote value stored");
        Ok(PutOutcome::Stored)
    }

    /// Write `value` only if the key is absent; returns the value already there.
    pub async fn put_if_absent(
        &self,
        key: &str,
        value: &ValueBox<V>,
    ) -> CacheResult<Option<ValueBox<V>>> {
        if value.is_empty() && !self.setting.allow_empty {
            return self.lookup(key).await;
        }

        let bytes = self.serializer.encode(value)?;
        let written = self
            .store
            .set_nx(&self.data_key(key), &bytes, self.ttl_for(value))
            .await?;
        if written {
            Ok(None)
        } else {
            self.lookup(key).await
        }
    }

    /// Re-extend the TTL of an existing entry; returns whether it existed.
    pub async fn touch(&self, key: &str, value: &ValueBox<V>) -> CacheResult<bool> {
        Ok(self
            .store
            .expire(&self.data_key(key), self.ttl_for(value))
            .await?)
    }

    pub async fn remaining_ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        Ok(self.store.ttl(&self.data_key(key)).await?)
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.store.del(&[self.data_key(key)]).await?;
        Ok(())
    }

    /// Delete every value of this cache; in-flight load locks are left alone.
    pub async fn remove_all(&self) -> CacheResult<u64> {
        let keys: Vec<String> = self
            .store
            .scan_prefix(&self.prefix)
            .await?
            .into_iter()
            .filter(|k| !k.ends_with(LOCK_SUFFIX))
            .collect();
        let removed = self.store.del(&keys).await?;
        tracing::debug!(cache = %self.name, removed, "remote tier cleared");
        Ok(removed)
    }
}

#[async_trait]
impl<V: CacheValue> Cache<V> for RemoteTier<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> CacheResult<Option<ValueBox<V>>> {
        self.lookup(key).await
    }

    async fn put(&self, key: &str, value: ValueBox<V>) -> CacheResult<()> {
        self.store(key, &value).await.map(|_| ())
    }

    async fn evict(&self, key: &str) -> CacheResult<()> {
        self.remove(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.remove_all().await.map(|_| ())
    }
}
