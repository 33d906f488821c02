//! Distributed store primitives consumed by the cache engine.
//!
//! The remote tier, the distributed lock, the invalidation publisher/listener
//! and the stats aggregator only need a handful of KV, pub/sub and list
//! operations. They all multiplex over one shared [`DistributedStore`].
//!
//! - [`RedisStore`]: production backend (deadpool-redis pool + dedicated pub/sub client)
//! - [`MemoryStore`]: in-process stand-in for single-instance mode and tests

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Stream of raw payloads received on a subscribed channel.
///
/// The stream ends when the subscription connection is lost.
pub type Subscription = BoxStream<'static, Vec<u8>>;

/// Errors that can occur while talking to the distributed store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store pool error: {0}")]
    Pool(String),

    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store subscribe error: {0}")]
    Subscribe(String),

    #[error("store unavailable")]
    Unavailable,

    #[error("subscription stream ended")]
    StreamEnded,
}

/// Shared distributed store.
///
/// Implementations must be cheap to share behind an `Arc` and safe for
/// concurrent use. Keys and channels are plain strings; values are bytes.
#[async_trait]
pub trait DistributedStore: Send + Sync + 'static {
    /// `GET key`
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// `SET key value [PX ttl]`
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// `SET key value NX PX ttl`; returns whether the key was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// `PEXPIRE key ttl`; returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// `PTTL key`; `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// `DEL key...`; returns the number of removed keys.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Atomically delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// `SCAN MATCH prefix*`
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// `PUBLISH channel payload`
    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<()>;

    /// `SUBSCRIBE channel`
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// `LPUSH key value`; returns the new list length.
    async fn list_push(&self, key: &str, value: &[u8]) -> StoreResult<u64>;

    /// `LRANGE key start stop` (inclusive, head = newest).
    async fn list_range(&self, key: &str, start: u64, stop: u64) -> StoreResult<Vec<Vec<u8>>>;

    /// `LTRIM key 0 len-1`: keep only the newest `len` entries.
    async fn list_trim(&self, key: &str, len: u64) -> StoreResult<()>;

    /// `LLEN key`
    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    /// Cheap liveness check.
    async fn ping(&self) -> StoreResult<()>;
}
