//! Orders and their repository.

use crate::error::{Classify, ErrorKind};
use crate::outbox::OutboxEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Saga in progress.
    Pending,
    /// Seats booked and paid.
    Confirmed,
    /// Saga compensated or failed.
    Failed,
    /// Cancelled without payment.
    Cancelled,
    /// Never completed before `expires_at`.
    Expired,
    /// Booking cancelled, refund outstanding.
    RefundPending,
    /// Booking cancelled and refunded.
    Refunded,
}

impl OrderStatus {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::RefundPending => "refund_pending",
            Self::Refunded => "refunded",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "refund_pending" => Some(Self::RefundPending),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// Payment lifecycle as seen by the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Nothing attempted yet.
    Pending,
    /// Authorized, not captured.
    Authorized,
    /// Funds captured.
    Captured,
    /// Authorization or capture refused.
    Failed,
    /// Captured funds returned.
    Refunded,
}

impl PaymentStatus {
    /// Storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "authorized" => Some(Self::Authorized),
            "captured" => Some(Self::Captured),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// A passenger on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPassenger {
    /// Identity document number.
    pub nid: String,
    /// Full name.
    pub name: String,
    /// Date of birth, `YYYY-MM-DD`.
    #[serde(default)]
    pub date_of_birth: String,
    /// Requested seat.
    pub seat_id: String,
    /// Gender, free text.
    #[serde(default)]
    pub gender: String,
    /// Age in years.
    #[serde(default)]
    pub age: u32,
    /// Set once the identity validator accepted the document.
    #[serde(default)]
    pub nid_verified: bool,
}

/// A seat realized by a confirmed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedSeat {
    /// Seat id.
    pub seat_id: String,
    /// Display number.
    pub seat_number: String,
    /// Seat class.
    pub seat_class: String,
    /// Ticket issued.
    pub ticket_id: Option<Uuid>,
    /// Price charged for the seat.
    pub price_paisa: i64,
}

/// An order row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id.
    pub id: Uuid,
    /// Tenant.
    pub organization_id: String,
    /// Buyer.
    pub user_id: String,
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from_station_id: String,
    /// Alighting stop.
    pub to_station_id: String,
    /// Passengers.
    pub passengers: Vec<OrderPassenger>,
    /// Sum of seat prices.
    pub subtotal_paisa: i64,
    /// Tax on the subtotal.
    pub tax_paisa: i64,
    /// Per-passenger booking fee.
    pub booking_fee_paisa: i64,
    /// Discount applied.
    pub discount_paisa: i64,
    /// Amount charged.
    pub total_paisa: i64,
    /// ISO currency code.
    pub currency: String,
    /// Provider transaction id.
    pub payment_id: Option<String>,
    /// Payment lifecycle.
    pub payment_status: PaymentStatus,
    /// Payment method chosen by the buyer (`card`, `bkash`, …).
    pub payment_method: String,
    /// Booking produced by the saga.
    pub booking_id: Option<Uuid>,
    /// Pre-existing hold supplied by the client.
    pub hold_id: Option<Uuid>,
    /// Seats realized on confirmation.
    pub seats: Vec<BookedSeat>,
    /// Order lifecycle.
    pub status: OrderStatus,
    /// Saga driving the order.
    pub saga_id: Option<Uuid>,
    /// Contact email.
    pub contact_email: String,
    /// Contact phone.
    pub contact_phone: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
    /// Payment window end.
    pub expires_at: DateTime<Utc>,
    /// Client-supplied deduplication key.
    pub idempotency_key: Option<String>,
}

/// Errors from an order repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderStoreError {
    /// The store failed.
    #[error("Order database error: {0}")]
    Database(String),

    /// A persisted order could not be decoded.
    #[error("Corrupt order {order_id}: {reason}")]
    Corrupt {
        /// The order.
        order_id: Uuid,
        /// What was wrong.
        reason: String,
    },
}

impl Classify for OrderStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) => ErrorKind::Transient,
            Self::Corrupt { .. } => ErrorKind::Invariant,
        }
    }
}

/// Result of inserting an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The order and its event were written.
    Inserted,
    /// Another order already owns the idempotency key; nothing was written.
    Duplicate(Box<Order>),
}

/// Boxed future returned by [`OrderRepository`] operations.
pub type OrderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OrderStoreError>> + Send + 'a>>;

/// Order persistence. Every write that carries an [`OutboxEntry`] stores both in
/// one transaction.
pub trait OrderRepository: Send + Sync {
    /// Insert an order and its creation event atomically.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on failure.
    fn insert<'a>(&'a self, order: &'a Order, event: &'a OutboxEntry)
    -> OrderFuture<'a, InsertOutcome>;

    /// Overwrite an order, optionally with an event, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on failure.
    fn update<'a>(
        &'a self,
        order: &'a Order,
        event: Option<&'a OutboxEntry>,
    ) -> OrderFuture<'a, ()>;

    /// Load an order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on failure.
    fn get(&self, order_id: Uuid) -> OrderFuture<'_, Option<Order>>;

    /// Find the order owning an idempotency key within a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on failure.
    fn find_by_idempotency_key<'a>(
        &'a self,
        organization_id: &'a str,
        key: &'a str,
    ) -> OrderFuture<'a, Option<Order>>;

    /// `pending` orders whose payment window closed at or before `now`,
    /// oldest deadline first.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on failure.
    fn expired_pending(&self, now: DateTime<Utc>, limit: usize) -> OrderFuture<'_, Vec<Order>>;

    /// A user's orders, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] on failure.
    fn list_for_user<'a>(
        &'a self,
        organization_id: &'a str,
        user_id: &'a str,
        limit: usize,
        offset: usize,
    ) -> OrderFuture<'a, Vec<Order>>;
}
