//! Orders: creation, lookup, cancellation.
//!
//! An order is the customer-facing record of a booking attempt. Creating one
//! prices the seats, persists the order with its `order.created` event and
//! starts the booking saga; the saga's terminal state then decides whether the
//! order is confirmed or failed. Orders left `pending` past their payment
//! window are expired by [`OrderSweeper`]. Every status change is written
//! together with its outbox event.

mod pricing;
mod service;
mod sweeper;

pub use pricing::{
    BOOKING_FEE_PER_PASSENGER_PAISA, CURRENCY, ORDER_TTL, TAX_RATE_PERCENT, Totals,
};
pub use service::{
    CancelOrderRequest, CreateOrderRequest, OrderPage, OrderService, OrderServiceConfig,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, ORDER_EXPIRED_REASON,
};
pub use sweeper::OrderSweeper;

use crate::entitlement::EntitlementError;
use crate::inventory::InventoryError;
use seatline_core::deadline::Deadline;
use seatline_core::error::{Classify, ErrorKind};
use seatline_core::inventory::SeatSpec;
use seatline_core::order::OrderStoreError;
use seatline_runtime::saga::SagaError;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Order service errors.
#[derive(Error, Debug)]
pub enum OrderError {
    /// The request is malformed.
    #[error("invalid order: {0}")]
    Validation(String),

    /// No such order for this caller.
    #[error("order {0} not found")]
    NotFound(Uuid),

    /// The operation does not apply to the order's status.
    #[error("order {order_id} is {status}")]
    InvalidState {
        /// The order.
        order_id: Uuid,
        /// Its status.
        status: &'static str,
    },

    /// Cancelling the booking failed; the order is unchanged.
    #[error("cancellation failed: {0}")]
    CancellationFailed(String),

    /// The organisation may not book.
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),

    /// Pricing or seat lookup failed.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// The orchestrator refused.
    #[error(transparent)]
    Saga(#[from] SagaError),

    /// The repository failed.
    #[error(transparent)]
    Store(#[from] OrderStoreError),

    /// A value could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl Classify for OrderError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidState { .. } => ErrorKind::Precondition,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CancellationFailed(_) => ErrorKind::Transient,
            Self::Entitlement(e) => e.kind(),
            Self::Inventory(e) => e.kind(),
            Self::Saga(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Encode(_) => ErrorKind::Invariant,
        }
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Boxed future returned by [`SeatPricing::quote`].
pub type PricingFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<SeatSpec>, InventoryError>> + Send + 'a>>;

/// Seat catalogue used to price an order.
pub trait SeatPricing: Send + Sync {
    /// The requested seats, validated against the trip and journey.
    fn quote<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        from: &'a str,
        to: &'a str,
        seat_ids: &'a [String],
        deadline: Deadline,
    ) -> PricingFuture<'a>;
}
