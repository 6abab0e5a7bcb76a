//! Tests against a real Redis server.
//!
//! Ignored by default; run with a server available:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1/ cargo test --test redis_live -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use turnstile::RedisSemaphore;
use turnstile::RedisSemaphoreConfig;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

async fn manager() -> redis::aio::ConnectionManager {
    let client = redis::Client::open(redis_url()).expect("valid redis url");
    redis::aio::ConnectionManager::new(client)
        .await
        .expect("redis reachable")
}

fn unique_namespace(tag: &str) -> String {
    format!("turnstile-test:{tag}:{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn acquire_release_against_live_redis() {
    let client = Arc::new(manager().await);
    let sem = RedisSemaphore::new(client, unique_namespace("basic"), 5).unwrap();

    let l1 = sem.acquire(2).await.unwrap();
    assert_eq!(sem.available_permits().await.unwrap(), 3);

    let info = sem.debug_info().await.unwrap();
    assert_eq!(info.usage, 2);
    assert_eq!(info.leases.len(), 1);

    sem.release(l1).await.unwrap();
    assert_eq!(sem.available_permits().await.unwrap(), 5);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn two_instances_converge_and_signal() {
    let client = Arc::new(manager().await);
    let namespace = unique_namespace("converge");
    let a = Arc::new(RedisSemaphore::new(Arc::clone(&client), namespace.clone(), 2).unwrap());
    let b = Arc::new(RedisSemaphore::new(client, namespace, 2).unwrap());

    let held = a.acquire(2).await.unwrap();
    assert_eq!(b.available_permits().await.unwrap(), 0);

    let waiter = Arc::clone(&b);
    let task = tokio::spawn(async move { waiter.acquire(1).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    a.release(held).await.unwrap();

    let lease = task.await.unwrap().unwrap();
    b.release(lease).await.unwrap();
    assert_eq!(a.available_permits().await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn crashed_holder_is_reclaimed_after_ttl() {
    let client = Arc::new(manager().await);
    let sem = RedisSemaphore::with_config(
        client,
        unique_namespace("crash"),
        3,
        RedisSemaphoreConfig {
            lease_expiration: Duration::from_secs(1),
        },
    )
    .unwrap();

    let abandoned = sem.acquire(3).await.unwrap();
    std::mem::forget(abandoned);
    assert_eq!(sem.available_permits().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(sem.available_permits().await.unwrap(), 3);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn pooled_client_works_transparently() {
    let config = deadpool_redis::Config::from_url(redis_url());
    let pool = config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("pool builds");

    let sem = RedisSemaphore::new(Arc::new(pool), unique_namespace("pool"), 4).unwrap();
    let lease = sem.acquire(4).await.unwrap();
    assert!(sem.try_acquire(1, None).await.unwrap().is_none());
    sem.release(lease).await.unwrap();
    assert_eq!(sem.available_permits().await.unwrap(), 4);
}
