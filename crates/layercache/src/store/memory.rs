//! In-process implementation of [`DistributedStore`].
//!
//! Used when Redis is disabled (single-instance mode) and in tests, where
//! several [`CacheManager`](crate::CacheManager)s sharing one `MemoryStore`
//! behave like separate processes sharing one Redis.
//!
//! Fault injection: [`set_available`](MemoryStore::set_available) simulates an
//! outage and [`disconnect_subscribers`](MemoryStore::disconnect_subscribers)
//! drops every live subscription.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{DistributedStore, StoreError, StoreResult, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct StoredEntry {
    data: Arc<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(data: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            data: Arc::new(data.to_vec()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| deadline <= Instant::now())
    }
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, StoredEntry>,
    lists: DashMap<String, VecDeque<Vec<u8>>>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    unavailable: AtomicBool,
}

/// Shared in-memory store; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// End every live subscription stream, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.inner.channels.clear();
    }

    /// Number of live (unexpired) keys.
    pub fn key_count(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|e| !e.value().is_expired())
            .count()
    }

    fn check(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn live_entry(&self, key: &str) -> Option<StoredEntry> {
        let entry = self.inner.entries.get(key)?.clone();
        if entry.is_expired() {
            self.inner
                .entries
                .remove_if(key, |_, stored| stored.is_expired());
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.live_entry(key).map(|e| e.data.as_ref().clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner
            .entries
            .insert(key.to_string(), StoredEntry::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::new(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        match self.inner.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check()?;
        Ok(self.live_entry(key).and_then(|e| {
            e.expires_at
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        }))
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        self.check()?;
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.inner.entries.remove(key) {
                if !entry.is_expired() {
                    removed += 1;
                }
            } else if self.inner.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.check()?;
        let removed = self.inner.entries.remove_if(key, |_, stored| {
            !stored.is_expired() && stored.data.as_slice() == expected
        });
        Ok(removed.is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        keys.extend(
            self.inner
                .lists
                .iter()
                .filter(|l| l.key().starts_with(prefix))
                .map(|l| l.key().clone()),
        );
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<()> {
        self.check()?;
        if let Some(sender) = self.inner.channels.get(channel) {
            // No receivers is not an error, same as PUBLISH returning 0.
            let _ = sender.send(payload.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.check()?;
        let receiver = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        // Lagged receivers skip ahead; the durable queue covers the gap.
        let stream =
            BroadcastStream::new(receiver).filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.check()?;
        let mut list = self.inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_vec());
        Ok(list.len() as u64)
    }

    async fn list_range(&self, key: &str, start: u64, stop: u64) -> StoreResult<Vec<Vec<u8>>> {
        self.check()?;
        let Some(list) = self.inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        if stop < start {
            return Ok(Vec::new());
        }
        let take = (stop - start + 1) as usize;
        Ok(list
            .iter()
            .skip(start as usize)
            .take(take)
            .cloned()
            .collect())
    }

    async fn list_trim(&self, key: &str, len: u64) -> StoreResult<()> {
        self.check()?;
        if len == 0 {
            self.inner.lists.remove(key);
            return Ok(());
        }
        if let Some(mut list) = self.inner.lists.get_mut(key) {
            list.truncate(len as usize);
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        self.check()?;
        Ok(self
            .inner
            .lists
            .get(key)
            .map(|l| l.len() as u64)
            .unwrap_or(0))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}
