//! Notification requests.
//!
//! Rendering and delivery belong to the notification service. This side only
//! records a `notification.requested` event in the outbox so the request
//! survives a crash and reaches the log exactly as often as the relay delivers.

use chrono::{DateTime, Utc};
use seatline_core::event::{event_types, topics};
use seatline_core::outbox::{OutboxEntry, OutboxError, OutboxStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Booking confirmed.
pub const BOOKING_CONFIRMED: &str = "booking_confirmed";
/// Booking cancelled.
pub const BOOKING_CANCELLED: &str = "booking_cancelled";

/// Body of a `notification.requested` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Template name.
    pub template: String,
    /// Order the notification is about.
    pub order_id: String,
    /// Recipient.
    pub user_id: String,
    /// Email, if known.
    pub email: String,
    /// Phone, if known.
    pub phone: String,
    /// Template variables.
    pub data: HashMap<String, String>,
}

/// Writes notification requests to the outbox.
#[derive(Clone)]
pub struct OutboxNotifier {
    outbox: Arc<dyn OutboxStore>,
}

impl OutboxNotifier {
    /// Notifier over `outbox`.
    #[must_use]
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self { outbox }
    }

    /// Queue `request`, keyed by its order.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the entry cannot be stored.
    pub async fn request(
        &self,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| OutboxError::Database(format!("encode notification: {e}")))?;
        let entry = OutboxEntry::new(
            topics::NOTIFICATIONS,
            event_types::NOTIFICATION_REQUESTED,
            request.order_id.clone(),
            payload,
            now,
        );
        self.outbox.append(&entry).await?;
        tracing::debug!(
            order_id = %request.order_id,
            template = %request.template,
            "Notification requested"
        );
        Ok(())
    }
}
