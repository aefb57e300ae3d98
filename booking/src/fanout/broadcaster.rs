//! Log consumer feeding the fan-out manager.

use super::{FanoutManager, LiveUpdate};
use seatline_core::event::EventEnvelope;
use seatline_core::event_bus::{EventHandler, HandlerError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Prefix of the per-node consumer group; a UUID is appended per process.
pub const REALTIME_GROUP_PREFIX: &str = "gateway-realtime";

/// Broadcasts inventory events to the streams of their trip.
///
/// Never fails: a live update nobody could receive is not worth redelivering.
#[derive(Clone)]
pub struct FanoutBroadcaster {
    manager: Arc<FanoutManager>,
}

impl FanoutBroadcaster {
    /// Broadcaster into `manager`.
    #[must_use]
    pub const fn new(manager: Arc<FanoutManager>) -> Self {
        Self { manager }
    }
}

impl EventHandler for FanoutBroadcaster {
    fn handle<'a>(
        &'a self,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            if event.aggregate_id.is_empty() {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Inventory event without trip id, skipped"
                );
                return Ok(());
            }
            let delivered = self.manager.broadcast(
                &event.aggregate_id,
                &LiveUpdate {
                    event_type: event.event_type.clone(),
                    data: event.payload.clone(),
                },
            );
            tracing::trace!(trip_id = %event.aggregate_id, delivered, "Live update broadcast");
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use seatline_core::event::event_types;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_reaches_trip_stream() {
        let manager = FanoutManager::new();
        let mut stream = manager.subscribe("T1");
        let broadcaster = FanoutBroadcaster::new(manager.clone());

        let event = EventEnvelope::new(
            event_types::SEATS_HELD,
            "T1",
            Utc::now(),
            json!({ "trip_id": "T1", "seat_ids": ["s1"], "status": "HELD" }),
        );
        broadcaster.handle(&event).await.unwrap();

        let update = stream.next().await.unwrap();
        assert_eq!(update.event_type, event_types::SEATS_HELD);
        assert_eq!(update.data["status"], "HELD");
    }

    #[tokio::test]
    async fn test_event_without_trip_is_acknowledged() {
        let broadcaster = FanoutBroadcaster::new(FanoutManager::new());
        let event = EventEnvelope::new(event_types::SEATS_HELD, "", Utc::now(), json!({}));
        assert!(broadcaster.handle(&event).await.is_ok());
    }
}
