//! Seat status events for live seat maps.
//!
//! Seat events are advisory: they drive seat-map refreshes, not business
//! state, so they are published straight to the bus and a failed publish is
//! only logged. Every event is keyed by trip so a trip's updates stay ordered.

use chrono::{DateTime, Utc};
use seatline_core::event::{EventEnvelope, topics};
use seatline_core::event_bus::EventBus;
use seatline_core::inventory::SegmentRange;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload of `inventory.seats_*` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatStatusChanged {
    /// Trip.
    pub trip_id: String,
    /// Seats that changed.
    pub seat_ids: Vec<String>,
    /// New status: `HELD`, `AVAILABLE` or `BOOKED`.
    pub status: String,
    /// First segment affected.
    pub segment_from: u32,
    /// One past the last segment affected.
    pub segment_to: u32,
    /// When the change happened.
    pub updated_at: DateTime<Utc>,
}

impl SeatStatusChanged {
    /// Event body for `seat_ids` moving to `status` over `segments`.
    #[must_use]
    pub fn new(
        trip_id: &str,
        seat_ids: &[String],
        status: &str,
        segments: SegmentRange,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            seat_ids: seat_ids.to_vec(),
            status: status.to_string(),
            segment_from: segments.start,
            segment_to: segments.end,
            updated_at,
        }
    }
}

/// Best-effort publisher onto the inventory topic.
#[derive(Clone, Default)]
pub struct SeatEventPublisher {
    bus: Option<Arc<dyn EventBus>>,
}

impl SeatEventPublisher {
    /// Publish through `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus: Some(bus) }
    }

    /// A publisher that drops everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { bus: None }
    }

    /// Publish `change` as `event_type`. Failures are logged, never returned.
    pub async fn publish(&self, event_type: &str, change: &SeatStatusChanged) {
        let Some(bus) = &self.bus else {
            return;
        };

        let envelope = match EventEnvelope::from_payload(
            event_type,
            change.trip_id.clone(),
            change.updated_at,
            change,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode seat event");
                return;
            }
        };

        if let Err(e) = bus.publish(topics::INVENTORY, &envelope).await {
            tracing::warn!(
                trip_id = %change.trip_id,
                event_type,
                error = %e,
                "Failed to publish seat event"
            );
        }
    }
}
