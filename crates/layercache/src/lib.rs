//! Two-tier coherent cache.
//!
//! A bounded process-local tier ([`LocalTier`], moka) sits in front of a
//! shared distributed tier ([`RemoteTier`], Redis). [`LayeringCache`] composes
//! them, de-duplicates concurrent loads with a [`DistributedLock`], and keeps
//! every process's local tier eventually consistent through the
//! [`invalidation`] protocol. Counters are merged into durable records by the
//! [`StatsAggregator`].
//!
//! ```no_run
//! use std::time::Duration;
//! use layercache::{
//!     CacheRuntime, LayeringCacheSetting, LayeringConfig, LocalTierSetting, RemoteTierSetting,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = CacheRuntime::start(&LayeringConfig::default()).await?;
//! let users = runtime.manager().get_or_create::<String>(
//!     "user",
//!     LayeringCacheSetting::new(
//!         LocalTierSetting::new(Duration::from_secs(60)),
//!         RemoteTierSetting::new(Duration::from_secs(600)),
//!     ),
//! )?;
//!
//! let name = users
//!     .get_or_load("42", || async { Ok::<_, std::io::Error>(Some("alice".to_string())) })
//!     .await?;
//! assert_eq!(name.as_deref(), Some("alice"));
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod namespace;
pub mod observability;
pub mod runtime;
pub mod serializer;
pub mod setting;
pub mod stats;
pub mod store;
pub mod value;

pub use cache::{Cache, CacheValue, LayeringCache, LocalTier, PutOutcome, RemoteTier};
pub use config::{LayeringConfig, RedisConfig};
pub use error::{BoxError, CacheError, CacheResult};
pub use invalidation::{
    InvalidationListener, InvalidationMessage, InvalidationPublisher, ListenerOptions,
    ListenerState, MessageKind,
};
pub use lock::DistributedLock;
pub use manager::{CacheManager, ManagedCache};
pub use namespace::Namespace;
pub use observability::{init_tracing, init_tracing_with_level};
pub use runtime::{CacheRuntime, create_store};
pub use serializer::{Serializer, SerializerKind};
pub use setting::{
    ExpireMode, LayeringCacheSetting, LoadErrorPolicy, LoadSetting, LocalTierSetting,
    RemoteTierSetting,
};
pub use stats::{AggregatorOptions, CacheStats, CacheStatsRecord, StatsAggregator, StatsSnapshot};
pub use store::{DistributedStore, MemoryStore, RedisStore, StoreError};
pub use value::ValueBox;
