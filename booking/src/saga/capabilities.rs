//! What the sagas need from the rest of the system.
//!
//! Each trait is owned by the saga side and implemented by an adapter over a
//! concrete component, so step code never names the inventory engine, the
//! payment registry or the identity provider directly.

use crate::identity::VerifyRequest;
use crate::inventory::{
    CancelledBooking, ConfirmRequest, ConfirmedBooking, HoldGranted, HoldRequest,
};
use crate::notifications::NotificationRequest;
use seatline_runtime::saga::StepError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Boxed future returned by capability calls.
pub type CapabilityFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StepError>> + Send + 'a>>;

/// Per-passenger identity check.
pub trait NidVerifier: Send + Sync {
    /// Succeed only if the registry confirms the document.
    fn verify<'a>(&'a self, request: &'a VerifyRequest) -> CapabilityFuture<'a, ()>;
}

/// Seat inventory.
pub trait InventoryClient: Send + Sync {
    /// Hold seats.
    fn hold_seats(&self, request: HoldRequest) -> CapabilityFuture<'_, HoldGranted>;

    /// Check that `user_id` owns the live hold `hold_id`.
    fn verify_hold<'a>(
        &'a self,
        org_id: &'a str,
        hold_id: Uuid,
        user_id: &'a str,
    ) -> CapabilityFuture<'a, ()>;

    /// Release a hold. Returns false if it was already gone.
    fn release_seats<'a>(
        &'a self,
        org_id: &'a str,
        hold_id: Uuid,
        user_id: &'a str,
    ) -> CapabilityFuture<'a, bool>;

    /// Convert a hold into a booking.
    fn confirm_booking(&self, request: ConfirmRequest) -> CapabilityFuture<'_, ConfirmedBooking>;

    /// Return a booking's seats.
    fn cancel_booking<'a>(
        &'a self,
        org_id: &'a str,
        booking_id: Uuid,
    ) -> CapabilityFuture<'a, CancelledBooking>;
}

/// Payment authorisation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCommand {
    /// Order being paid.
    pub order_id: String,
    /// Amount in paisa.
    pub amount_paisa: i64,
    /// ISO currency.
    pub currency: String,
    /// Payment method (`card`, `bkash`, ...).
    pub method: String,
    /// Customer email.
    pub customer_email: String,
    /// Customer phone.
    pub customer_phone: String,
}

/// An authorised payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Provider transaction id.
    pub payment_id: String,
    /// Provider that holds it.
    pub provider: String,
}

/// Payments.
pub trait PaymentClient: Send + Sync {
    /// Authorise funds.
    fn authorize<'a>(&'a self, command: &'a PaymentCommand) -> CapabilityFuture<'a, Authorization>;

    /// Capture an authorised payment.
    fn capture<'a>(&'a self, provider: &'a str, payment_id: &'a str) -> CapabilityFuture<'a, ()>;

    /// Refund a captured payment. Returns the refund id.
    fn refund<'a>(
        &'a self,
        provider: &'a str,
        payment_id: &'a str,
        amount_paisa: i64,
        reason: &'a str,
    ) -> CapabilityFuture<'a, String>;
}

/// Customer notifications.
pub trait NotificationClient: Send + Sync {
    /// Queue a notification.
    fn notify<'a>(&'a self, request: &'a NotificationRequest) -> CapabilityFuture<'a, ()>;
}
