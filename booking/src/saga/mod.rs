//! Booking and cancellation sagas.
//!
//! The step code lives here; ordering, compensation, persistence and retry
//! are the orchestrator's job (`seatline_runtime::saga`). Steps reach other
//! components only through the [`capabilities`] traits.

pub mod booking;
pub mod cancellation;
pub mod capabilities;

pub use booking::{BookingInput, booking_saga};
pub use cancellation::{CancellationInput, cancellation_saga};
pub use capabilities::{
    Authorization, CapabilityFuture, InventoryClient, NidVerifier, NotificationClient,
    PaymentClient, PaymentCommand,
};

use seatline_core::saga::SagaRecord;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Registered name of the booking saga.
pub const BOOKING_SAGA: &str = "booking";
/// Registered name of the cancellation saga.
pub const CANCELLATION_SAGA: &str = "cancellation";

/// Context bag keys.
pub mod keys {
    /// The saga's input record.
    pub const INPUT: &str = "input";
    /// Every passenger's identity was confirmed.
    pub const NID_VERIFIED: &str = "nid_verified";
    /// Hold taken or verified by the hold step.
    pub const HOLD_ID: &str = "hold_id";
    /// When that hold lapses.
    pub const HOLD_EXPIRES_AT: &str = "hold_expires_at";
    /// Provider transaction id.
    pub const PAYMENT_ID: &str = "payment_id";
    /// Provider holding the payment.
    pub const PAYMENT_PROVIDER: &str = "payment_provider";
    /// Funds were captured and not yet refunded.
    pub const CAPTURED: &str = "captured";
    /// Booking created by the confirm step.
    pub const BOOKING_ID: &str = "booking_id";
    /// Tickets issued by the confirm step.
    pub const TICKETS: &str = "tickets";
    /// Refund issued by a compensation or the cancellation saga.
    pub const REFUND_ID: &str = "refund_id";
    /// Amount refunded, in paisa.
    pub const REFUND_AMOUNT: &str = "refund_amount";
    /// The cancellation saga released the booking's seats.
    pub const BOOKING_CANCELLED: &str = "booking_cancelled";
}

/// Step names.
pub mod steps {
    #![allow(missing_docs)]

    pub const VERIFY_IDENTITY: &str = "verify_identity";
    pub const HOLD_SEATS: &str = "hold_seats";
    pub const AUTHORIZE_PAYMENT: &str = "authorize_payment";
    pub const CAPTURE_PAYMENT: &str = "capture_payment";
    pub const CONFIRM_BOOKING: &str = "confirm_booking";
    pub const NOTIFY: &str = "notify";

    pub const CANCEL_BOOKING: &str = "cancel_booking";
    pub const REFUND_PAYMENT: &str = "refund_payment";
    pub const SEND_CANCELLATION_NOTICE: &str = "send_cancellation_notice";
}

/// Everything the sagas call out to.
#[derive(Clone)]
pub struct SagaCapabilities {
    /// Identity registry.
    pub identity: Arc<dyn NidVerifier>,
    /// Seat inventory.
    pub inventory: Arc<dyn InventoryClient>,
    /// Payments.
    pub payments: Arc<dyn PaymentClient>,
    /// Notifications.
    pub notifications: Arc<dyn NotificationClient>,
}

/// Decode a context value from a persisted record.
#[must_use]
pub fn context_value<T: DeserializeOwned>(record: &SagaRecord, key: &str) -> Option<T> {
    record
        .context
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
