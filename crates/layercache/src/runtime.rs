//! Wiring: store selection and the background tasks of one process.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{LayeringConfig, RedisConfig};
use crate::error::{CacheError, CacheResult};
use crate::invalidation::InvalidationListener;
use crate::manager::CacheManager;
use crate::observability;
use crate::serializer::Serializer;
use crate::stats::StatsAggregator;
use crate::store::{DistributedStore, MemoryStore, RedisStore};

/// Create the distributed store based on configuration.
///
/// ## Store Modes
///
/// - **Redis disabled**: Returns an in-process store (single instance)
/// - **Redis enabled**: Returns a Redis store, even if Redis is down right now
///
/// ## Graceful Degradation
///
/// Connections are opened lazily by the pool. While Redis is unreachable every
/// store call fails with a backend error, which the caches treat as a remote
/// miss: values come straight from the loader and nothing is cached remotely.
/// Once Redis is back the same store picks it up again.
pub async fn create_store(config: &RedisConfig) -> CacheResult<Arc<dyn DistributedStore>> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = Duration::from_millis(config.timeout_ms);
    let pool_config = redis_config.pool.get_or_insert_with(Default::default);
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| CacheError::config(format!("invalid redis configuration: {e}")))?;

    let store = RedisStore::new(pool, config.url.clone());
    match store.ping().await {
        Ok(()) => tracing::info!("Connected to Redis"),
        Err(e) => tracing::warn!(
            error = %e,
            "Redis unreachable at startup. Serving from loaders until it comes back."
        ),
    }
    Ok(Arc::new(store))
}

/// A running cache engine: the registry plus its background tasks.
///
/// The invalidation listener and poller always run; the stats aggregator
/// runs when `stats.enabled` is set.
pub struct CacheRuntime {
    manager: CacheManager,
    listener: InvalidationListener,
    aggregator: Option<StatsAggregator>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheRuntime {
    /// Connect to the configured store and start the background tasks.
    pub async fn start(config: &LayeringConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;
        let store = create_store(&config.redis).await?;
        Self::start_with_store(store, config)
    }

    /// Start on an existing store. Must be called within a Tokio runtime.
    pub fn start_with_store(
        store: Arc<dyn DistributedStore>,
        config: &LayeringConfig,
    ) -> CacheResult<Self> {
        config.validate().map_err(CacheError::Config)?;

        if !observability::apply_logging_level(&config.logging.level) {
            tracing::debug!(
                level = %config.logging.level,
                "tracing not initialised by layercache, logging.level ignored"
            );
        }

        let manager = CacheManager::builder(store)
            .namespace(config.namespace.namespace())
            .serializer(Serializer::new(config.serializer))
            .max_queue_len(config.invalidation.max_queue_len)
            .build();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener =
            InvalidationListener::new(manager.clone(), config.invalidation.listener_options());
        let mut tasks = listener.spawn(shutdown_rx.clone());

        let aggregator = config.stats.enabled.then(|| {
            StatsAggregator::new(manager.clone(), config.stats.aggregator_options())
        });
        if let Some(aggregator) = &aggregator {
            tasks.push(aggregator.clone().spawn(shutdown_rx));
        }

        tracing::info!(
            namespace = %manager.namespace().scope(),
            origin = %manager.origin(),
            stats = config.stats.enabled,
            "layering cache runtime started"
        );

        Ok(Self {
            manager,
            listener,
            aggregator,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    pub fn listener(&self) -> &InvalidationListener {
        &self.listener
    }

    pub fn aggregator(&self) -> Option<&StatsAggregator> {
        self.aggregator.as_ref()
    }

    /// Signal every background task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("layering cache runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::ListenerState;
    use crate::setting::{LayeringCacheSetting, LocalTierSetting, RemoteTierSetting};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_disabled_redis_uses_memory_store() {
        let store = create_store(&RedisConfig::default()).await.unwrap();
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades_to_loader() {
        let config = RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 200,
            ..Default::default()
        };
        let store = create_store(&config).await.unwrap();
        assert!(store.ping().await.is_err());

        let manager = CacheManager::builder(store.clone()).build();
        let cache = manager
            .get_or_create::<String>(
                "user",
                LayeringCacheSetting::new(
                    LocalTierSetting::new(Duration::from_secs(60)),
                    RemoteTierSetting::new(Duration::from_secs(300)),
                ),
            )
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            let value = cache
                .get_or_load("1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(Some("fresh".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("fresh"));
        }
        // Nothing was cached anywhere, so every read reached the loader.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_redis_url_is_a_config_error() {
        let config = RedisConfig {
            enabled: true,
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_store(&config).await,
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = CacheRuntime::start_with_store(
            Arc::new(MemoryStore::new()),
            &LayeringConfig::default(),
        )
        .unwrap();
        assert!(runtime.aggregator().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.listener().state(), ListenerState::Subscribed);

        runtime.shutdown().await;
        assert_eq!(runtime.listener().state(), ListenerState::Degraded);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = LayeringConfig::default();
        config.stats.period_secs = 0;
        let result = tokio_test::block_on(CacheRuntime::start(&config));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
