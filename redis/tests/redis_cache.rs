//! `RedisCache` integration tests.
//!
//! Run with: cargo test -p seatline-redis -- --ignored
//!
//! Requires: `REDIS_URL` env var or Redis on localhost:6379. Keys are prefixed
//! per run so concurrent runs do not collide.

#![allow(clippy::expect_used)]

use futures::StreamExt;
use seatline_core::cache::{SharedCache, Tally};
use seatline_redis::RedisCache;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn prefix() -> String {
    format!("test_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

async fn cache() -> RedisCache {
    RedisCache::new(&redis_url())
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_prelock_is_exclusive_and_value_checked() {
    let cache = cache().await;
    let key = format!("{}:inventory:lock:t1:0:A1", prefix());

    assert!(cache.set_nx(&key, "hold-1", Duration::from_secs(10)).await.expect("set_nx"));
    assert!(!cache.set_nx(&key, "hold-2", Duration::from_secs(10)).await.expect("set_nx"));

    assert!(!cache.delete_if_equals(&key, "hold-2").await.expect("delete"));
    assert!(cache.delete_if_equals(&key, "hold-1").await.expect("delete"));
    assert_eq!(cache.get(&key).await.expect("get"), None);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_tallies_are_all_or_nothing() {
    let cache = cache().await;
    let p = prefix();
    let tally = |name: &str, limit: i64| Tally {
        key: format!("{p}:ticketlimit:{name}"),
        increment: 2,
        limit,
        ttl: Duration::from_secs(60),
    };
    let batch = [tally("user", 6), tally("nid", 2)];

    assert_eq!(cache.check_and_increment(&batch).await.expect("tally"), None);
    assert_eq!(cache.check_and_increment(&batch).await.expect("tally"), Some(1));
    assert_eq!(
        cache.get(&batch[0].key).await.expect("get").as_deref(),
        Some("2")
    );

    cache.decrement(&batch[0].key, 5).await.expect("decrement");
    assert_eq!(
        cache.get(&batch[0].key).await.expect("get").as_deref(),
        Some("0")
    );
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_scan_finds_matching_keys() {
    let cache = cache().await;
    let p = prefix();
    for suffix in ["seatmap:o1:t1", "seatmap:o1:t2", "hold:o1:h1"] {
        cache
            .set(&format!("{p}:{suffix}"), "x", Duration::from_secs(30))
            .await
            .expect("set");
    }

    let keys = cache.scan_keys(&format!("{p}:seatmap:*")).await.expect("scan");
    assert_eq!(
        keys,
        vec![format!("{p}:seatmap:o1:t1"), format!("{p}:seatmap:o1:t2")]
    );
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_pubsub_round_trip() {
    let cache = cache().await;
    let channel = format!("{}:entitlement:invalidate", prefix());
    let mut messages = cache.subscribe(&channel).await.expect("subscribe");

    cache.publish(&channel, "org-1").await.expect("publish");
    let received = tokio::time::timeout(Duration::from_secs(5), messages.next())
        .await
        .expect("message within timeout");
    assert_eq!(received.as_deref(), Some("org-1"));
}
