//! Cross-process invalidation of local tiers.
//!
//! ## How It Works
//!
//! 1. A mutating cache call pushes an [`InvalidationMessage`] onto a durable,
//!    bounded list and publishes it on a pub/sub channel
//! 2. Every process runs an [`InvalidationListener`]: a live subscriber for
//!    low-latency delivery plus a poller that replays the durable list
//! 3. Message ids are remembered, so a message delivered by both paths is
//!    applied once
//! 4. The publishing process applies its own messages only to the other
//!    configurations (fingerprints) registered under the same cache name
//!
//! ```text
//! Process A: cache.evict("1")
//!   ↓
//! LPUSH layering-cache:message:{scope}   (trimmed to max_queue_len)
//! PUBLISH layering-cache:channel:{scope}
//!   ↓
//! Process B: live listener (or poller, if the channel is down) → evict local "1"
//! ```

mod listener;

pub use listener::{InvalidationListener, ListenerOptions, ListenerState};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::namespace::Namespace;
use crate::store::DistributedStore;

/// What a message asks receivers to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Evict,
    Clear,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evict => "evict",
            Self::Clear => "clear",
        }
    }
}

/// One invalidation, as written to the queue and the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub id: Uuid,
    /// Publishing process.
    pub origin: Uuid,
    pub cache_name: String,
    /// Setting fingerprint of the publishing cache. Within the publishing
    /// process only the other configurations of `cache_name` act on it.
    #[serde(default)]
    pub fingerprint: String,
    /// Target key; `None` for `Clear`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub kind: MessageKind,
    pub published_at_ms: i64,
}

impl InvalidationMessage {
    pub fn evict(origin: Uuid, cache_name: &str, fingerprint: &str, key: &str) -> Self {
        Self::new(
            origin,
            cache_name,
            fingerprint,
            Some(key.to_string()),
            MessageKind::Evict,
        )
    }

    pub fn clear(origin: Uuid, cache_name: &str, fingerprint: &str) -> Self {
        Self::new(origin, cache_name, fingerprint, None, MessageKind::Clear)
    }

    fn new(
        origin: Uuid,
        cache_name: &str,
        fingerprint: &str,
        key: Option<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            cache_name: cache_name.to_string(),
            fingerprint: fingerprint.to_string(),
            key,
            kind,
            published_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Publishes invalidations for every cache of one process.
pub struct InvalidationPublisher {
    store: Arc<dyn DistributedStore>,
    origin: Uuid,
    channel: String,
    queue: String,
    max_queue_len: u64,
}

impl InvalidationPublisher {
    pub fn new(
        store: Arc<dyn DistributedStore>,
        namespace: &Namespace,
        origin: Uuid,
        max_queue_len: u64,
    ) -> Self {
        Self {
            store,
            origin,
            channel: namespace.channel(),
            queue: namespace.message_queue(),
            max_queue_len: max_queue_len.max(1),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub async fn publish_evict(&self, cache_name: &str, fingerprint: &str, key: &str) {
        self.publish(&InvalidationMessage::evict(
            self.origin,
            cache_name,
            fingerprint,
            key,
        ))
        .await;
    }

    pub async fn publish_clear(&self, cache_name: &str, fingerprint: &str) {
        self.publish(&InvalidationMessage::clear(self.origin, cache_name, fingerprint))
            .await;
    }

    /// Queue then broadcast `message`.
    ///
    /// Store failures are logged and never returned to the caller.
    pub async fn publish(&self, message: &InvalidationMessage) {
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode invalidation message");
                return;
            }
        };

        match self.store.list_push(&self.queue, &payload).await {
            Ok(len) if len > self.max_queue_len => {
                if let Err(e) = self.store.list_trim(&self.queue, self.max_queue_len).await {
                    tracing::warn!(queue = %self.queue, error = %e, "failed to trim invalidation queue");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue,
                    cache = %message.cache_name,
                    error = %e,
                    "failed to queue invalidation message"
                );
            }
        }

        if let Err(e) = self.store.publish(&self.channel, &payload).await {
            tracing::warn!(
                channel = %self.channel,
                cache = %message.cache_name,
                error = %e,
                "failed to publish invalidation message"
            );
            return;
        }

        tracing::debug!(
            cache = %message.cache_name,
            key = ?message.key,
            kind = message.kind.as_str(),
            "published invalidation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures_util::StreamExt;

    fn publisher(memory: &MemoryStore, max_queue_len: u64) -> InvalidationPublisher {
        InvalidationPublisher::new(
            Arc::new(memory.clone()),
            &Namespace::new("svc", None),
            Uuid::new_v4(),
            max_queue_len,
        )
    }

    #[test]
    fn test_message_json_shape() {
        let origin = Uuid::new_v4();
        let msg = InvalidationMessage::evict(origin, "user", "60000-120000", "1");
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "evict");
        assert_eq!(json["cache_name"], "user");
        assert_eq!(json["key"], "1");
        assert_eq!(json["fingerprint"], "60000-120000");

        let clear = InvalidationMessage::clear(origin, "user", "60000-120000");
        let json: serde_json::Value =
            serde_json::from_slice(&clear.to_bytes().unwrap()).unwrap();
        assert!(json.get("key").is_none());
        assert_eq!(
            InvalidationMessage::from_bytes(&clear.to_bytes().unwrap()).unwrap(),
            clear
        );
    }

    #[tokio::test]
    async fn test_publish_queues_and_broadcasts() {
        let memory = MemoryStore::new();
        let publisher = publisher(&memory, 100);
        let mut sub = memory.subscribe("layering-cache:channel:svc").await.unwrap();

        publisher.publish_evict("user", "1-2", "1").await;

        let raw = sub.next().await.unwrap();
        let msg = InvalidationMessage::from_bytes(&raw).unwrap();
        assert_eq!(msg.kind, MessageKind::Evict);
        assert_eq!(msg.origin, publisher.origin());
        assert_eq!(
            memory.list_len("layering-cache:message:svc").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let memory = MemoryStore::new();
        let publisher = publisher(&memory, 3);
        for i in 0..10 {
            publisher.publish_evict("user", "1-2", &i.to_string()).await;
        }
        assert_eq!(
            memory.list_len("layering-cache:message:svc").await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let memory = MemoryStore::new();
        let publisher = publisher(&memory, 10);
        memory.set_available(false);
        publisher.publish_clear("user", "1-2").await;
        memory.set_available(true);
        assert_eq!(
            memory.list_len("layering-cache:message:svc").await.unwrap(),
            0
        );
    }
}
