//! Transactional outbox.
//!
//! A mutation that must be announced writes its business row and an
//! [`OutboxEntry`] in the same transaction. A relay later moves pending entries
//! onto the event bus. Any committed mutation therefore has a matching entry that
//! is either pending (`processed_at IS NULL`) or delivered.

use crate::error::{Classify, ErrorKind};
use crate::event::{ENVELOPE_VERSION, EventEnvelope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// One row of the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Row id; also the published event id.
    pub id: Uuid,
    /// Partition key.
    pub aggregate_id: String,
    /// Event type.
    pub event_type: String,
    /// Destination topic.
    pub topic: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// Insertion time; delivery order within an aggregate follows it.
    pub created_at: DateTime<Utc>,
    /// Set once the log acknowledged the publish.
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub retries: i32,
}

impl OutboxEntry {
    /// A new pending entry.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            topic: topic.into(),
            payload,
            created_at,
            processed_at: None,
            retries: 0,
        }
    }

    /// The envelope published for this entry. The envelope id is the row id so
    /// that republishing after a crash yields the same event id.
    #[must_use]
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            timestamp: self.created_at,
            version: ENVELOPE_VERSION,
            payload: self.payload.clone(),
        }
    }
}

/// Errors from an outbox store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// The store failed.
    #[error("Outbox database error: {0}")]
    Database(String),

    /// The referenced entry does not exist.
    #[error("Outbox entry not found: {0}")]
    NotFound(Uuid),
}

impl Classify for OutboxError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Boxed future returned by [`OutboxStore`] operations.
pub type OutboxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OutboxError>> + Send + 'a>>;

/// Relay-side access to the outbox.
///
/// Transactional appends happen inside repository implementations; this trait
/// only exposes what the relay and tests need.
pub trait OutboxStore: Send + Sync {
    /// Append a standalone entry (outside any business transaction).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on failure.
    fn append<'a>(&'a self, entry: &'a OutboxEntry) -> OutboxFuture<'a, ()>;

    /// Up to `limit` pending, not dead-lettered entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on failure.
    fn pending(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxEntry>>;

    /// Mark an entry delivered.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on failure.
    fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> OutboxFuture<'_, ()>;

    /// Record a failed attempt. Returns the new retry count.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on failure.
    fn record_failure<'a>(&'a self, id: Uuid, error: &'a str) -> OutboxFuture<'a, i32>;

    /// Park an entry in the dead-letter queue so the relay skips it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on failure.
    fn dead_letter<'a>(&'a self, id: Uuid, reason: &'a str) -> OutboxFuture<'a, ()>;

    /// Delete delivered entries processed before `before`. Returns rows deleted.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] on failure.
    fn purge_processed(&self, before: DateTime<Utc>) -> OutboxFuture<'_, u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_reuses_row_id() {
        let entry = OutboxEntry::new(
            "travio.orders",
            "order.created",
            "order-1",
            json!({ "order_id": "order-1" }),
            Utc::now(),
        );
        let envelope = entry.to_envelope();

        assert_eq!(envelope.id, entry.id);
        assert_eq!(envelope.event_type, "order.created");
        assert_eq!(envelope.aggregate_id, "order-1");
        assert_eq!(envelope.timestamp, entry.created_at);
        assert!(entry.processed_at.is_none());
        assert_eq!(entry.retries, 0);
    }
}
