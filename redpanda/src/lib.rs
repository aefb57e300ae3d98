//! Redpanda event bus for Seatline.
//!
//! [`RedpandaEventBus`] implements the [`EventBus`] trait from `seatline-core`
//! over rdkafka, so any Kafka-compatible log works behind it.
//!
//! # Delivery Semantics
//!
//! **Producer**: idempotent, `acks=all`, one in-flight request per connection.
//! Each envelope is keyed by its `aggregate_id`, so events for one order, trip or
//! payment land on one partition in publish order. The `event_type` and
//! `event_id` travel as headers so consumers can route without decoding.
//!
//! **Consumer**: at-least-once with manual offset commits.
//! - [`EventBus::subscribe`] commits after the envelope reaches the subscriber's channel
//! - [`RedpandaEventBus::consume`] commits only after the handler returns `Ok`
//!   and rewinds to the failed offset otherwise
//!
//! # Consumer Groups
//!
//! - [`ConsumerGroup::Shared`]: one group id shared by every instance; partitions are
//!   split across them (order processing, notifications)
//! - [`ConsumerGroup::UniquePerNode`]: a fresh `{prefix}-{uuid}` per process so every
//!   node sees every event (real-time fan-out)
//!
//! # Example
//!
//! ```no_run
//! use seatline_core::event::{EventEnvelope, topics, event_types};
//! use seatline_core::event_bus::EventBus;
//! use seatline_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .unique_consumer_group("gateway-realtime")
//!     .build()?;
//!
//! let event = EventEnvelope::new(
//!     event_types::SEATS_HELD,
//!     "trip-42",
//!     chrono::Utc::now(),
//!     serde_json::json!({ "trip_id": "trip-42", "seat_ids": ["A1"] }),
//! );
//! bus.publish(topics::INVENTORY, &event).await?;
//!
//! let mut stream = bus.subscribe(&[topics::INVENTORY]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(event) => println!("Received: {}", event.event_type),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Offset;
use seatline_core::event::EventEnvelope;
use seatline_core::event_bus::{EventBus, EventBusError, EventHandler, EventStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Header carrying the envelope's event type.
pub const EVENT_TYPE_HEADER: &str = "event_type";
/// Header carrying the envelope's id.
pub const EVENT_ID_HEADER: &str = "event_id";

/// Pause before a failed message is redelivered to its handler.
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(500);

/// How subscriptions choose their consumer-group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerGroup {
    /// All instances share `group.id` and split partitions between them.
    Shared(String),
    /// Each process joins its own group (`{prefix}-{uuid}`) and sees every event.
    UniquePerNode(String),
}

impl ConsumerGroup {
    /// Resolve the concrete `group.id`.
    ///
    /// [`Self::UniquePerNode`] generates the suffix once at build time, so every
    /// subscription from the same bus shares one per-node group.
    #[must_use]
    pub fn resolve(&self) -> String {
        match self {
            Self::Shared(name) => name.clone(),
            Self::UniquePerNode(prefix) => unique_group_id(prefix),
        }
    }
}

/// `{prefix}-{uuid}`, e.g. `gateway-realtime-6f1c…`.
#[must_use]
pub fn unique_group_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Redpanda-backed [`EventBus`].
///
/// # Example
///
/// ```no_run
/// use seatline_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("order-service")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    /// Producer send timeout
    timeout: Duration,
    /// Resolved `group.id` for every consumer this bus creates
    group_id: String,
    /// Event buffer size for subscribers
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a bus with default configuration in the `seatline-default` group.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Broker list this bus was built with.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// The consumer-group id used by subscriptions.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn create_consumer(&self, topics: &[String]) -> Result<StreamConsumer, EventBusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .set("partition.assignment.strategy", "roundrobin")
            .create()
            .map_err(|e| EventBusError::SubscriptionFailed {
                topics: topics.to_vec(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| EventBusError::SubscriptionFailed {
                topics: topics.to_vec(),
                reason: format!("Failed to subscribe to topics: {e}"),
            })?;

        tracing::info!(
            topics = ?topics,
            consumer_group = %self.group_id,
            auto_offset_reset = %self.auto_offset_reset,
            manual_commit = true,
            "Subscribed to topics"
        );
        Ok(consumer)
    }

    /// Drive `handler` over `topics` until `shutdown` flips to `true`.
    ///
    /// The offset of a message is committed only when the handler returns `Ok`.
    /// On `Err` the partition is rewound to that offset after a short pause, so
    /// the same message is handed to the handler again. Messages that do not
    /// decode as an [`EventEnvelope`] are logged and committed.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    pub async fn consume(
        &self,
        topics: &[&str],
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EventBusError> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let consumer = self.create_consumer(&topics)?;

        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                message = consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to receive message");
                    continue;
                }
            };

            let event = match decode(&message) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %e,
                        "Skipping undecodable message"
                    );
                    commit(&consumer, &message);
                    continue;
                }
            };

            match handler.handle(&event).await {
                Ok(()) => commit(&consumer, &message),
                Err(e) => {
                    tracing::warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Handler failed; message will be redelivered"
                    );
                    let topic = message.topic().to_string();
                    let partition = message.partition();
                    let offset = message.offset();
                    drop(message);

                    tokio::time::sleep(REDELIVERY_BACKOFF).await;
                    if let Err(e) = consumer.seek(
                        &topic,
                        partition,
                        Offset::Offset(offset),
                        Timeout::After(self.timeout),
                    ) {
                        tracing::error!(
                            topic = %topic,
                            partition,
                            offset,
                            error = %e,
                            "Failed to rewind partition for redelivery"
                        );
                    }
                }
            }
        }

        tracing::info!(consumer_group = %self.group_id, "Consumer stopped");
        Ok(())
    }
}

fn decode(message: &BorrowedMessage<'_>) -> Result<EventEnvelope, EventBusError> {
    let payload = message
        .payload()
        .ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))?;
    EventEnvelope::from_bytes(payload).map_err(|e| EventBusError::DeserializationFailed(e.to_string()))
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
        tracing::warn!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<ConsumerGroup>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker list, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Compression codec: `none`, `gzip`, `snappy`, `lz4` or `zstd`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout, also used for partition seeks.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Join a shared consumer group so instances split the partitions.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(ConsumerGroup::Shared(consumer_group.into()));
        self
    }

    /// Join a fresh `{prefix}-{uuid}` group so this process receives every event.
    #[must_use]
    pub fn unique_consumer_group(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_group = Some(ConsumerGroup::UniquePerNode(prefix.into()));
        self
    }

    /// Number of envelopes buffered between the consumer task and a subscriber.
    ///
    /// Default: 1000
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts: `"earliest"` or `"latest"`.
    ///
    /// Default: `"latest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// Without an explicit group, subscriptions join `seatline-default`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "1")
            .set("retries", "5")
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let group_id = self
            .consumer_group
            .unwrap_or_else(|| ConsumerGroup::Shared("seatline-default".to_string()))
            .resolve();
        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "latest".to_string());

        tracing::info!(
            brokers = %brokers,
            compression,
            consumer_group = %group_id,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created successfully"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            group_id,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = event.to_bytes().map_err(|e| EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
            let event_id = event.id.to_string();

            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: EVENT_TYPE_HEADER,
                    value: Some(event.event_type.as_str()),
                })
                .insert(Header {
                    key: EVENT_ID_HEADER,
                    value: Some(event_id.as_str()),
                });

            let record = FutureRecord::to(topic)
                .payload(&payload)
                .key(event.aggregate_id.as_str())
                .headers(headers);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic,
                        partition,
                        offset,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        "Event published successfully"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic,
                        event_id = %event.id,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let consumer = self.create_consumer(&topics)?;
            let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);

            // The task owns the consumer; an offset is committed only after its
            // envelope is in the channel.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(message) => {
                            let event_result = decode(&message);
                            if let Ok(event) = &event_result {
                                tracing::trace!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    event_type = %event.event_type,
                                    "Received event"
                                );
                            }

                            if tx.send(event_result).await.is_err() {
                                tracing::debug!("Channel receiver dropped, exiting consumer task");
                                break;
                            }
                            commit(&consumer, &message);
                        }
                        Err(e) => {
                            let err = EventBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn test_unique_groups_differ_per_resolution() {
        let group = ConsumerGroup::UniquePerNode("gateway-realtime".to_string());
        let a = group.resolve();
        let b = group.resolve();

        assert!(a.starts_with("gateway-realtime-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_group_is_stable() {
        let group = ConsumerGroup::Shared("order-service".to_string());
        assert_eq!(group.resolve(), "order-service");
        assert_eq!(group.resolve(), group.resolve());
    }

    #[test]
    fn test_build_without_brokers_fails() {
        assert!(matches!(
            RedpandaEventBus::builder().build(),
            Err(EventBusError::ConnectionFailed(_))
        ));
    }
}
