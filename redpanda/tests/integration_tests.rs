//! Integration tests for [`RedpandaEventBus`] against a real Kafka-compatible broker.
//!
//! Covered:
//! - Publish/subscribe round-trip of the JSON envelope
//! - Unique per-node groups each receiving every event
//! - Handler-gated commits with redelivery on failure
//! - Per-aggregate ordering
//!
//! These tests are `#[ignore]` because they need Docker and take a while to
//! start the broker:
//!
//! ```bash
//! cargo test -p seatline-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use futures::StreamExt;
use seatline_core::event::EventEnvelope;
use seatline_core::event_bus::{EventBus, EventHandler, HandlerError};
use seatline_redpanda::RedpandaEventBus;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio::sync::{Mutex, watch};

fn test_event(event_type: &str, aggregate_id: &str, n: u64) -> EventEnvelope {
    EventEnvelope::new(event_type, aggregate_id, Utc::now(), json!({ "n": n }))
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");
    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = RedpandaEventBus::new(brokers) {
            let event = test_event("warmup", "warmup", 0);
            if bus.publish("warmup-topic", &event).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

/// Publishes a warmup event so the topic is auto-created before consumers join.
async fn ensure_topic_exists(bus: &RedpandaEventBus, topic: &str) {
    let warmup = test_event("warmup", "warmup", 0);
    for attempt in 1..=30 {
        if bus.publish(topic, &warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempt != 30, "Failed to create topic {topic}");
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, "travio.orders").await;

    let mut stream = bus.subscribe(&["travio.orders"]).await.expect("subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let created = test_event("order.created", "order-1", 1);
    bus.publish("travio.orders", &created).await.expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = stream
                .next()
                .await
                .expect("stream open")
                .expect("decodable event");
            if event.event_type != "warmup" {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for event");

    assert_eq!(received, created);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unique_groups_each_receive_every_event() {
    let (_kafka, brokers) = start_kafka().await;
    let node = |prefix: &str| {
        RedpandaEventBus::builder()
            .brokers(&brokers)
            .unique_consumer_group(prefix)
            .auto_offset_reset("earliest")
            .build()
            .expect("Failed to create event bus")
    };
    let node_a = node("gateway-realtime");
    let node_b = node("gateway-realtime");
    assert_ne!(node_a.group_id(), node_b.group_id());

    ensure_topic_exists(&node_a, "travio.inventory").await;
    let mut stream_a = node_a.subscribe(&["travio.inventory"]).await.expect("subscribe a");
    let mut stream_b = node_b.subscribe(&["travio.inventory"]).await.expect("subscribe b");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let held = test_event("inventory.seats_held", "trip-1", 1);
    node_a.publish("travio.inventory", &held).await.expect("publish");

    for stream in [&mut stream_a, &mut stream_b] {
        let got = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = stream.next().await.expect("open").expect("decodable");
                if event.event_type != "warmup" {
                    return event;
                }
            }
        })
        .await
        .expect("each node receives the event");
        assert_eq!(got.id, held.id);
    }
}

/// Fails the first delivery of every event, then succeeds.
struct FlakyHandler {
    attempts: AtomicUsize,
    handled: Mutex<Vec<EventEnvelope>>,
}

impl EventHandler for FlakyHandler {
    fn handle<'a>(
        &'a self,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            if event.event_type == "warmup" {
                return Ok(());
            }
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(HandlerError("projection store unavailable".to_string()));
            }
            self.handled.lock().await.push(event.clone());
            Ok(())
        })
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failed_handler_gets_redelivery() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&brokers)
            .consumer_group("catalog-consumer")
            .auto_offset_reset("earliest")
            .build()
            .expect("Failed to create event bus"),
    );
    ensure_topic_exists(&bus, "travio.catalog").await;

    let handler = Arc::new(FlakyHandler {
        attempts: AtomicUsize::new(0),
        handled: Mutex::new(Vec::new()),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_bus = Arc::clone(&bus);
    let consumer_handler: Arc<dyn EventHandler> = handler.clone();
    let task = tokio::spawn(async move {
        consumer_bus
            .consume(&["travio.catalog"], consumer_handler, shutdown_rx)
            .await
    });

    let trip = test_event("trip.created", "trip-9", 9);
    bus.publish("travio.catalog", &trip).await.expect("publish");

    tokio::time::timeout(Duration::from_secs(20), async {
        while handler.handled.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("event handled after redelivery");

    shutdown_tx.send(true).expect("signal shutdown");
    task.await.expect("join").expect("consumer result");

    assert!(handler.attempts.load(Ordering::SeqCst) >= 2);
    assert_eq!(handler.handled.lock().await[0].id, trip.id);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_events_for_one_aggregate_stay_ordered() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("ordering")
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, "travio.payments").await;

    let mut stream = bus.subscribe(&["travio.payments"]).await.expect("subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    for n in 0..10 {
        bus.publish("travio.payments", &test_event("payment.captured", "order-7", n))
            .await
            .expect("publish");
    }

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while seen.len() < 10 {
            let event = stream.next().await.expect("open").expect("decodable");
            if event.aggregate_id == "order-7" {
                seen.push(event.payload["n"].as_u64().expect("n"));
            }
        }
    })
    .await
    .expect("Timeout waiting for events");

    assert_eq!(seen, (0..10).collect::<Vec<u64>>());
}
