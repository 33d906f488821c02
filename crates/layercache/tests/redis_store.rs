//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up a Redis instance and are ignored by
//! default; run them with `cargo test -- --ignored` where Docker is available.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use layercache::{
    Cache, CacheManager, DistributedLock, DistributedStore, InvalidationListener, LayeringCacheSetting,
    ListenerOptions, LocalTierSetting, Namespace, RedisConfig, RemoteTierSetting, ValueBox,
    create_store,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_store() -> Arc<dyn DistributedStore> {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        ..Default::default()
    };
    create_store(&config).await.unwrap()
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_store_primitives() {
    let store = redis_store().await;

    store.set("it:k", b"v", Some(Duration::from_secs(30))).await.unwrap();
    assert_eq!(store.get("it:k").await.unwrap(), Some(b"v".to_vec()));
    let ttl = store.ttl("it:k").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(30));

    assert!(!store.set_nx("it:k", b"w", Duration::from_secs(30)).await.unwrap());
    assert!(!store.delete_if_equals("it:k", b"w").await.unwrap());
    assert!(store.delete_if_equals("it:k", b"v").await.unwrap());

    for i in 0..5 {
        store.list_push("it:queue", i.to_string().as_bytes()).await.unwrap();
    }
    store.list_trim("it:queue", 3).await.unwrap();
    assert_eq!(store.list_len("it:queue").await.unwrap(), 3);
    let newest = store.list_range("it:queue", 0, 0).await.unwrap();
    assert_eq!(newest, vec![b"4".to_vec()]);
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_pubsub_round_trip() {
    let store = redis_store().await;
    let mut sub = store.subscribe("it:channel").await.unwrap();

    // Give the subscription a moment to register server-side.
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.publish("it:channel", b"hello").await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, b"hello".to_vec());
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_lock_is_exclusive() {
    let store = redis_store().await;
    let mut first = DistributedLock::new(
        store.clone(),
        "it:resource",
        Duration::from_secs(5),
        Duration::ZERO,
    );
    let mut second = DistributedLock::new(
        store.clone(),
        "it:resource",
        Duration::from_secs(5),
        Duration::from_millis(50),
    );

    assert!(first.try_acquire().await);
    assert!(!second.try_acquire().await);
    first.release().await;
    assert!(second.try_acquire().await);
    second.release().await;
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_two_instances_stay_coherent() {
    let store = redis_store().await;
    let setting = LayeringCacheSetting::new(
        LocalTierSetting::new(Duration::from_secs(60)),
        RemoteTierSetting::new(Duration::from_secs(300)),
    );

    let a = CacheManager::builder(store.clone())
        .namespace(Namespace::new("coherence", None))
        .build();
    let b = CacheManager::builder(store.clone())
        .namespace(Namespace::new("coherence", None))
        .build();
    let cache_a = a.get_or_create::<String>("user", setting.clone()).unwrap();
    let cache_b = b.get_or_create::<String>("user", setting).unwrap();
    let listener_b = InvalidationListener::new(b.clone(), ListenerOptions::default());

    cache_b
        .get_or_load("1", || async { Ok::<_, std::io::Error>(Some("v1".to_string())) })
        .await
        .unwrap();
    cache_a.put("1", ValueBox::present("v2".to_string())).await.unwrap();

    assert_eq!(listener_b.poll_once().await.unwrap(), 1);
    assert_eq!(cache_b.get("1").await.unwrap().as_deref(), Some("v2"));
}
