//! Applies invalidations published by other processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{InvalidationMessage, MessageKind};
use crate::error::CacheResult;
use crate::manager::CacheManager;
use crate::metrics;
use crate::store::{DistributedStore, StoreError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const APPLIED_ID_TTL: Duration = Duration::from_secs(600);
const APPLIED_ID_CAPACITY: u64 = 100_000;

/// Connection state of the live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Live messages are arriving on the channel.
    Subscribed,
    /// The channel is down; only the poller is delivering.
    Degraded,
}

/// Tuning knobs of the listener.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub poll_interval: Duration,
    pub max_queue_len: u64,
    pub batch_size: u64,
    pub clock_skew_tolerance: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_queue_len: 1000,
            batch_size: 100,
            clock_skew_tolerance: Duration::from_secs(2),
        }
    }
}

/// Live subscriber plus durable-queue poller for one process.
///
/// Both paths feed [`apply`](Self::apply), which skips the publishing cache
/// and any message id it has already applied. Cloning is cheap.
#[derive(Clone)]
pub struct InvalidationListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    manager: CacheManager,
    store: Arc<dyn DistributedStore>,
    origin: Uuid,
    channel: String,
    queue: String,
    options: ListenerOptions,
    applied: moka::future::Cache<Uuid, ()>,
    subscribed: AtomicBool,
    /// `published_at_ms` of the newest queue entry seen so far.
    watermark_ms: AtomicI64,
    /// When the live subscription was last lost, or 0.
    degraded_since_ms: AtomicI64,
    wake: Notify,
}

impl InvalidationListener {
    pub fn new(manager: CacheManager, options: ListenerOptions) -> Self {
        let namespace = manager.namespace().clone();
        let applied = moka::future::Cache::builder()
            .max_capacity(APPLIED_ID_CAPACITY)
            .time_to_live(APPLIED_ID_TTL)
            .build();

        Self {
            inner: Arc::new(ListenerInner {
                store: manager.store().clone(),
                origin: manager.origin(),
                channel: namespace.channel(),
                queue: namespace.message_queue(),
                manager,
                options: ListenerOptions {
                    batch_size: options.batch_size.max(1),
                    max_queue_len: options.max_queue_len.max(1),
                    ..options
                },
                applied,
                subscribed: AtomicBool::new(false),
                watermark_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
                degraded_since_ms: AtomicI64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ListenerState {
        if self.inner.subscribed.load(Ordering::SeqCst) {
            ListenerState::Subscribed
        } else {
            ListenerState::Degraded
        }
    }

    pub fn watermark_ms(&self) -> i64 {
        self.inner.watermark_ms.load(Ordering::SeqCst)
    }

    /// Spawn the live subscriber and the poller.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let live = self.clone();
        let live_shutdown = shutdown.clone();
        let poller = self.clone();
        vec![
            tokio::spawn(async move { live.run_live(live_shutdown).await }),
            tokio::spawn(async move { poller.run_poller(shutdown).await }),
        ]
    }

    /// Apply one message to the local tiers registered under its cache name.
    ///
    /// A message from this process skips the publishing cache itself, which
    /// already updated its local tier, and reaches only the other
    /// configurations of that name. Returns `false` when nothing was
    /// targeted or the id was already applied.
    pub async fn apply(&self, message: &InvalidationMessage, path: &'static str) -> bool {
        let inner = &self.inner;
        let own = message.origin == inner.origin;
        let caches: Vec<_> = inner
            .manager
            .caches_named(&message.cache_name)
            .into_iter()
            .filter(|cache| !own || cache.setting().fingerprint() != message.fingerprint)
            .collect();
        if own && caches.is_empty() {
            return false;
        }
        if inner.applied.contains_key(&message.id) {
            return false;
        }
        inner.applied.insert(message.id, ()).await;

        match (message.kind, message.key.as_deref()) {
            (MessageKind::Evict, Some(key)) => {
                for cache in &caches {
                    cache.evict_local(key).await;
                }
            }
            (MessageKind::Evict, None) => {
                tracing::warn!(id = %message.id, cache = %message.cache_name, "evict message without key");
                return false;
            }
            (MessageKind::Clear, _) => {
                for cache in &caches {
                    cache.clear_local();
                }
            }
        }

        metrics::record_invalidation(message.kind.as_str(), path);
        tracing::debug!(
            cache = %message.cache_name,
            key = ?message.key,
            kind = message.kind.as_str(),
            path,
            "applied invalidation"
        );
        true
    }

    /// Replay the durable queue once; returns how many messages were applied.
    ///
    /// The queue is read newest-first until an entry older than
    /// `watermark - clock_skew_tolerance` is found, then the collected entries
    /// are applied oldest-first. Scanning `max_queue_len` entries without
    /// reaching that point means entries were trimmed before this process saw
    /// them, so every local tier is cleared.
    pub async fn poll_once(&self) -> CacheResult<usize> {
        let inner = &self.inner;
        let options = &inner.options;
        let watermark = inner.watermark_ms.load(Ordering::SeqCst);
        let floor = watermark - options.clock_skew_tolerance.as_millis() as i64;

        let mut pending = Vec::new();
        let mut offset = 0u64;
        let mut reached_floor = false;

        while offset < options.max_queue_len {
            let stop = (offset + options.batch_size).min(options.max_queue_len) - 1;
            let page = inner.store.list_range(&inner.queue, offset, stop).await?;
            let requested = stop - offset + 1;
            let fetched = page.len() as u64;

            for raw in page {
                let message = match InvalidationMessage::from_bytes(&raw) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(queue = %inner.queue, error = %e, "skipping malformed invalidation message");
                        continue;
                    }
                };
                if message.published_at_ms < floor {
                    reached_floor = true;
                    break;
                }
                pending.push(message);
            }

            if reached_floor || fetched < requested {
                reached_floor = true;
                break;
            }
            offset += fetched;
        }

        if !reached_floor {
            tracing::warn!(
                queue = %inner.queue,
                scanned = offset,
                "invalidation queue overran the watermark, clearing local tiers"
            );
            inner.manager.clear_all_local();
        }

        let newest = pending
            .iter()
            .map(|m| m.published_at_ms)
            .max()
            .unwrap_or(watermark);
        inner.watermark_ms.fetch_max(newest, Ordering::SeqCst);

        let mut applied = 0;
        for message in pending.iter().rev() {
            if self.apply(message, "queue").await {
                applied += 1;
            }
        }
        if applied > 0 {
            tracing::debug!(applied, "caught up from invalidation queue");
        }
        Ok(applied)
    }

    async fn run_poller(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.options.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                tracing::info!("invalidation poller shutting down");
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.wake.notified() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("invalidation poller shutting down");
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "invalidation poll failed");
            }
        }
    }

    async fn run_live(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let error = tokio::select! {
                result = self.listen() => match result {
                    Ok(()) => break,
                    Err(e) => e,
                },
                _ = shutdown.changed() => break,
            };

            if self.mark_degraded() {
                backoff = INITIAL_BACKOFF;
            }
            tracing::warn!(
                channel = %self.inner.channel,
                error = %error,
                backoff_ms = backoff.as_millis() as u64,
                "invalidation channel lost, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }

            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        self.inner.subscribed.store(false, Ordering::SeqCst);
        tracing::info!("invalidation listener shutting down");
    }

    /// Subscribe and apply messages until the stream ends.
    async fn listen(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut stream = inner.store.subscribe(&inner.channel).await?;

        inner.subscribed.store(true, Ordering::SeqCst);
        let since = inner.degraded_since_ms.swap(0, Ordering::SeqCst);
        if since > 0 {
            tracing::info!(channel = %inner.channel, degraded_since_ms = since, "invalidation channel restored");
        } else {
            tracing::info!(channel = %inner.channel, "subscribed to invalidation channel");
        }
        // Catch up on whatever was missed while disconnected.
        inner.wake.notify_one();

        while let Some(payload) = stream.next().await {
            match InvalidationMessage::from_bytes(&payload) {
                Ok(message) => {
                    self.apply(&message, "live").await;
                }
                Err(e) => {
                    tracing::warn!(channel = %inner.channel, error = %e, "failed to parse invalidation payload");
                }
            }
        }

        Err(StoreError::StreamEnded)
    }

    /// Returns whether the listener was subscribed until now.
    fn mark_degraded(&self) -> bool {
        let inner = &self.inner;
        let was_subscribed = inner.subscribed.swap(false, Ordering::SeqCst);
        if was_subscribed {
            inner
                .degraded_since_ms
                .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
        }
        was_subscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Namespace;
    use crate::cache::{Cache, LayeringCache};
    use crate::setting::{LayeringCacheSetting, LocalTierSetting, RemoteTierSetting};
    use crate::store::MemoryStore;
    use crate::value::ValueBox;

    fn manager(memory: &MemoryStore) -> CacheManager {
        CacheManager::builder(Arc::new(memory.clone()))
            .namespace(Namespace::new("svc", None))
            .max_queue_len(50)
            .build()
    }

    fn user_cache(manager: &CacheManager) -> LayeringCache<String> {
        manager
            .get_or_create(
                "user",
                LayeringCacheSetting::new(
                    LocalTierSetting::new(Duration::from_secs(60)),
                    RemoteTierSetting::new(Duration::from_secs(120)),
                ),
            )
            .unwrap()
    }

    fn options(max_queue_len: u64) -> ListenerOptions {
        ListenerOptions {
            poll_interval: Duration::from_millis(20),
            max_queue_len,
            batch_size: 4,
            clock_skew_tolerance: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_poll_applies_foreign_evict() {
        let memory = MemoryStore::new();
        let a = manager(&memory);
        let b = manager(&memory);
        let cache_a = user_cache(&a);
        let cache_b = user_cache(&b);
        let listener_b = InvalidationListener::new(b.clone(), options(50));

        cache_b.local().unwrap().insert("1", "stale".to_string()).await;
        cache_a.evict("1").await.unwrap();

        assert_eq!(listener_b.poll_once().await.unwrap(), 1);
        assert_eq!(cache_b.local().unwrap().lookup("1").await, None);
        // Already applied: a second poll is a no-op.
        assert_eq!(listener_b.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_own_messages_are_skipped() {
        let memory = MemoryStore::new();
        let a = manager(&memory);
        let cache_a = user_cache(&a);
        let listener_a = InvalidationListener::new(a.clone(), options(50));

        cache_a
            .put("1", ValueBox::Present("mine".to_string()))
            .await
            .unwrap();
        assert_eq!(listener_a.poll_once().await.unwrap(), 0);
        assert_eq!(cache_a.local().unwrap().lookup("1").await.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn test_own_messages_reach_sibling_configurations() {
        let memory = MemoryStore::new();
        let a = manager(&memory);
        let writer = user_cache(&a);
        let sibling: LayeringCache<String> = a
            .get_or_create(
                "user",
                LayeringCacheSetting::new(
                    LocalTierSetting::new(Duration::from_secs(30)),
                    RemoteTierSetting::new(Duration::from_secs(120)),
                ),
            )
            .unwrap();
        let listener = InvalidationListener::new(a.clone(), options(50));

        sibling
            .get_or_load("1", || async {
                Ok::<_, std::io::Error>(Some("v1".to_string()))
            })
            .await
            .unwrap();
        writer
            .put("1", ValueBox::Present("v2".to_string()))
            .await
            .unwrap();

        assert_eq!(listener.poll_once().await.unwrap(), 1);
        assert_eq!(sibling.local().unwrap().lookup("1").await, None);
        assert_eq!(sibling.get("1").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(
            writer.local().unwrap().lookup("1").await.as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_poller_honours_shutdown_sent_before_spawn() {
        let memory = MemoryStore::new();
        let b = manager(&memory);
        let listener = InvalidationListener::new(b.clone(), options(50));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let handles = listener.spawn(shutdown_rx);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("task stops without the sender being dropped")
                .unwrap();
        }
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let memory = MemoryStore::new();
        let b = manager(&memory);
        let cache_b = user_cache(&b);
        let listener = InvalidationListener::new(b.clone(), options(50));

        let message = InvalidationMessage::evict(Uuid::new_v4(), "user", "60000-120000", "1");
        cache_b.local().unwrap().insert("1", "x".to_string()).await;
        assert!(listener.apply(&message, "live").await);
        cache_b.local().unwrap().insert("1", "y".to_string()).await;
        assert!(!listener.apply(&message, "queue").await);
        assert_eq!(cache_b.local().unwrap().lookup("1").await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_trimmed_gap_clears_local_tiers() {
        let memory = MemoryStore::new();
        let a = manager(&memory);
        let b = manager(&memory);
        let cache_b = user_cache(&b);
        let listener_b = InvalidationListener::new(b.clone(), options(5));

        cache_b.local().unwrap().insert("untouched", "x".to_string()).await;
        for i in 0..10 {
            a.publisher()
                .publish_evict("user", "60000-120000", &format!("k{i}")).await;
        }

        listener_b.poll_once().await.unwrap();
        assert_eq!(cache_b.local().unwrap().lookup("untouched").await, None);
    }

    #[tokio::test]
    async fn test_old_entries_are_not_replayed() {
        let memory = MemoryStore::new();
        let a = manager(&memory);
        let b = manager(&memory);
        let cache_b = user_cache(&b);

        let mut old = InvalidationMessage::evict(a.origin(), "user", "60000-120000", "1");
        old.published_at_ms -= 60_000;
        memory
            .list_push("layering-cache:message:svc", &old.to_bytes().unwrap())
            .await
            .unwrap();

        let listener_b = InvalidationListener::new(b.clone(), options(50));
        cache_b.local().unwrap().insert("1", "x".to_string()).await;
        assert_eq!(listener_b.poll_once().await.unwrap(), 0);
        assert_eq!(cache_b.local().unwrap().lookup("1").await.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_live_listener_tracks_subscription_state() {
        let memory = MemoryStore::new();
        let b = manager(&memory);
        let listener = InvalidationListener::new(b.clone(), options(50));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = listener.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.state(), ListenerState::Subscribed);

        memory.set_available(false);
        memory.disconnect_subscribers();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.state(), ListenerState::Degraded);

        memory.set_available(true);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(listener.state(), ListenerState::Subscribed);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
