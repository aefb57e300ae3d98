//! Domain event envelope and the topic / event-type catalogue.
//!
//! Every event that crosses a service boundary travels in an [`EventEnvelope`]:
//!
//! ```json
//! {
//!   "id": "8a7c…",
//!   "type": "inventory.seats_held",
//!   "aggregate_id": "trip-42",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "version": 1,
//!   "payload": { "trip_id": "trip-42", "seat_ids": ["s1"] }
//! }
//! ```
//!
//! The aggregate id doubles as the partition key on the durable log, which is what
//! gives per-aggregate ordering. Consumers dedupe on `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

/// Error types for envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize the envelope or its payload.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize the envelope or its payload.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// Durable-log topics.
pub mod topics {
    /// Order lifecycle events.
    pub const ORDERS: &str = "travio.orders";
    /// Payment lifecycle events.
    pub const PAYMENTS: &str = "travio.payments";
    /// Seat inventory mutations, consumed by every fan-out node.
    pub const INVENTORY: &str = "travio.inventory";
    /// Ticket generation.
    pub const FULFILLMENT: &str = "travio.fulfillment";
    /// Notification requests and receipts.
    pub const NOTIFICATIONS: &str = "travio.notifications";
    /// Trip and station catalogue.
    pub const CATALOG: &str = "travio.catalog";

    /// All topics, in declaration order.
    pub const ALL: [&str; 6] = [ORDERS, PAYMENTS, INVENTORY, FULFILLMENT, NOTIFICATIONS, CATALOG];
}

/// Event type names carried in the envelope `type` field and the `event_type` header.
pub mod event_types {
    #![allow(missing_docs)]

    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const ORDER_FAILED: &str = "order.failed";

    pub const PAYMENT_AUTHORIZED: &str = "payment.authorized";
    pub const PAYMENT_CAPTURED: &str = "payment.captured";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_REFUNDED: &str = "payment.refunded";

    pub const SEATS_HELD: &str = "inventory.seats_held";
    pub const SEATS_RELEASED: &str = "inventory.seats_released";
    pub const SEATS_BOOKED: &str = "inventory.seats_booked";

    pub const TICKET_GENERATED: &str = "fulfillment.ticket_generated";
    pub const NOTIFICATION_REQUESTED: &str = "notification.requested";
    pub const NOTIFICATION_SENT: &str = "notification.sent";

    pub const TRIP_CREATED: &str = "trip.created";
    pub const STATION_CREATED: &str = "station.created";
}

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

/// The wire format of every published domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event id; consumers dedupe on it.
    pub id: Uuid,
    /// Event type, e.g. `order.created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Aggregate the event belongs to; used as the partition key.
    pub aggregate_id: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Envelope schema version.
    pub version: u32,
    /// Event-specific body.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Builds a fresh envelope with a random id.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            timestamp,
            version: ENVELOPE_VERSION,
            payload,
        }
    }

    /// Builds an envelope whose body is the JSON form of `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if `payload` cannot be encoded.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: &T,
    ) -> Result<Self, EventError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;
        Ok(Self::new(event_type, aggregate_id, timestamp, payload))
    }

    /// Decodes the payload into a typed body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EventError::DeserializationError(e.to_string()))
    }

    /// Encodes the envelope as JSON bytes for the log.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] on encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Decodes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_uses_type_field_name() {
        let envelope = EventEnvelope::new(
            event_types::ORDER_CREATED,
            "order-1",
            Utc::now(),
            json!({ "order_id": "order-1" }),
        );

        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "order.created");
        assert_eq!(value["aggregate_id"], "order-1");
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn test_typed_payload_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct SeatsHeld {
            trip_id: String,
            seat_ids: Vec<String>,
        }

        let body = SeatsHeld {
            trip_id: "T1".into(),
            seat_ids: vec!["s1".into()],
        };
        let envelope =
            EventEnvelope::from_payload(event_types::SEATS_HELD, "T1", Utc::now(), &body).unwrap();
        let decoded = EventEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.payload_as::<SeatsHeld>().unwrap(), body);
        assert_eq!(decoded.id, envelope.id);
    }

    #[test]
    fn test_malformed_bytes_are_rejected() {
        assert!(matches!(
            EventEnvelope::from_bytes(b"not json"),
            Err(EventError::DeserializationError(_))
        ));
    }
}
