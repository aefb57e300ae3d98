//! Event bus abstraction over the durable log.
//!
//! Domain mutations never publish directly. They append to the outbox inside the
//! business transaction, and the relay moves outbox rows onto the bus:
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────┐      ┌───────────────┐
//! │ business row +   │─────►│ outbox relay │─────►│   event bus   │
//! │ outbox row (tx)  │ poll │ (single task)│ pub  │ (Redpanda)    │
//! └──────────────────┘      └──────────────┘      └───────┬───────┘
//!                                                         │
//!                                  ┌──────────────────────┼────────────────┐
//!                                  ▼                      ▼                ▼
//!                           fan-out node A         fan-out node B     other services
//!                       (unique group id)       (unique group id)   (shared group id)
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: events may be delivered multiple times
//! - **Idempotency**: subscribers dedupe on the envelope `id`
//! - **Ordered within partition**: the envelope `aggregate_id` is the partition key
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `seatline-testing` - for tests
//! - `RedpandaEventBus` in `seatline-redpanda` - for production

use crate::error::{Classify, ErrorKind};
use crate::event::EventEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a message into an [`EventEnvelope`]
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl Classify for EventBusError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::DeserializationFailed(_) => ErrorKind::Permanent,
            Self::InvalidTopic(_) => ErrorKind::Precondition,
            Self::ConnectionFailed(_)
            | Self::PublishFailed { .. }
            | Self::SubscriptionFailed { .. }
            | Self::ConsumerGroupError(_)
            | Self::TransportError(_) => ErrorKind::Transient,
        }
    }
}

/// Stream of envelopes from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, EventBusError>> + Send>>;

/// Publish/subscribe over the durable log.
///
/// Publishing uses the envelope's `aggregate_id` as the message key and attaches
/// `event_type` and `event_id` headers.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn EventBus>`, which is how every component receives it.
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the log does not acknowledge the write.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>>;

    /// Subscribe to one or more topics.
    ///
    /// Whether the subscription shares work with other processes (a named consumer
    /// group) or receives every event (a unique per-process group) is a property of
    /// the implementation's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

/// Failure reported by an [`EventHandler`]; the message is not acknowledged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

/// A consumer-side handler whose success gates offset commit.
///
/// `Ok(())` acknowledges the message. `Err` leaves it uncommitted so the log
/// redelivers it.
pub trait EventHandler: Send + Sync {
    /// Handle one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the message should be redelivered.
    fn handle<'a>(
        &'a self,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}
