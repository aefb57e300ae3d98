//! Durable-log consumers.
//!
//! Delivery is at-least-once, so each consumer remembers the event ids it has
//! handled in the shared cache and skips repeats.

mod catalog;

pub use catalog::{CATALOG_CONSUMER, CATALOG_CONSUMER_GROUP, CatalogConsumer};

use seatline_core::cache::SharedCache;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long a handled event id is remembered.
pub const PROCESSED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Handled-event ledger for one consumer, kept in the shared cache.
#[derive(Clone)]
pub struct ProcessedEvents {
    cache: Arc<dyn SharedCache>,
    consumer: &'static str,
}

impl ProcessedEvents {
    /// Ledger for `consumer`.
    #[must_use]
    pub fn new(cache: Arc<dyn SharedCache>, consumer: &'static str) -> Self {
        Self { cache, consumer }
    }

    fn key(&self, event_id: Uuid) -> String {
        format!("processed:{}:{event_id}", self.consumer)
    }

    /// Whether `event_id` was handled. An unreachable cache answers no;
    /// handlers are idempotent, so reprocessing is safe.
    pub async fn seen(&self, event_id: Uuid) -> bool {
        match self.cache.get(&self.key(event_id)).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                tracing::warn!(consumer = self.consumer, %event_id, error = %e, "Dedupe lookup failed");
                false
            }
        }
    }

    /// Remember `event_id`.
    pub async fn mark(&self, event_id: Uuid) {
        if let Err(e) = self.cache.set(&self.key(event_id), "1", PROCESSED_TTL).await {
            tracing::warn!(consumer = self.consumer, %event_id, error = %e, "Dedupe mark failed");
        }
    }
}
