//! Catalog events: a new trip gets its seat inventory.

use super::ProcessedEvents;
use crate::inventory::InventoryEngine;
use seatline_core::deadline::Deadline;
use seatline_core::error::Classify;
use seatline_core::event::{EventEnvelope, event_types};
use seatline_core::event_bus::{EventHandler, HandlerError};
use seatline_core::inventory::TripManifest;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Shared consumer group: one node initialises each trip.
pub const CATALOG_CONSUMER_GROUP: &str = "inventory-catalog";

/// Ledger name of the catalog consumer.
pub const CATALOG_CONSUMER: &str = "catalog";

/// Initialises inventory for `trip.created` events.
#[derive(Clone)]
pub struct CatalogConsumer {
    engine: Arc<InventoryEngine>,
    processed: ProcessedEvents,
    timeout: Duration,
}

impl CatalogConsumer {
    /// Consumer over `engine`, deduplicating through `processed`.
    #[must_use]
    pub fn new(engine: Arc<InventoryEngine>, processed: ProcessedEvents) -> Self {
        Self {
            engine,
            processed,
            timeout: Duration::from_secs(30),
        }
    }

    async fn trip_created(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let manifest: TripManifest = match event.payload_as() {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Undecodable trip.created, skipped");
                return Ok(());
            }
        };

        match self
            .engine
            .initialize_trip(&manifest, Deadline::after(self.timeout))
            .await
        {
            Ok(trip) => {
                tracing::info!(
                    trip_id = %trip.trip_id,
                    created = trip.created,
                    rows = trip.row_count,
                    "Trip inventory initialised"
                );
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(HandlerError(e.to_string())),
            Err(e) => {
                // Redelivering a bad manifest would loop forever.
                tracing::error!(
                    event_id = %event.id,
                    trip_id = %manifest.trip_id,
                    kind = %e.kind(),
                    error = %e,
                    "Trip inventory rejected"
                );
                Ok(())
            }
        }
    }
}

impl EventHandler for CatalogConsumer {
    fn handle<'a>(
        &'a self,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        let span = tracing::info_span!("catalog_event", event_id = %event.id, event_type = %event.event_type);
        Box::pin(tracing::Instrument::instrument(
            async move {
                if event.event_type != event_types::TRIP_CREATED {
                    return Ok(());
                }
                if self.processed.seen(event.id).await {
                    tracing::debug!("Duplicate delivery skipped");
                    return Ok(());
                }
                self.trip_created(event).await?;
                self.processed.mark(event.id).await;
                Ok(())
            },
            span,
        ))
    }
}
