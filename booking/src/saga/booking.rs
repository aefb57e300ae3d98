//! The booking saga.
//!
//! ```text
//! verify_identity -> hold_seats -> authorize_payment -> capture_payment
//!                 -> confirm_booking -> notify
//! ```
//!
//! A failure at any step rolls back the completed ones in reverse: the
//! booking is cancelled, captured funds are refunded, the hold is released.
//! Notification is best-effort and never fails the saga.

use super::capabilities::{
    InventoryClient, NidVerifier, NotificationClient, PaymentClient, PaymentCommand,
};
use super::{BOOKING_SAGA, SagaCapabilities, keys, steps};
use crate::identity::VerifyRequest;
use crate::inventory::{ConfirmRequest, HoldRequest};
use crate::notifications::{BOOKING_CONFIRMED, NotificationRequest};
use chrono::{DateTime, NaiveDate, Utc};
use seatline_core::error::ErrorKind;
use seatline_core::inventory::{BookingPassenger, SeatTicket};
use seatline_core::order::OrderPassenger;
use seatline_runtime::saga::{SagaContext, SagaDefinition, StepDefinition, StepError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything the booking saga needs, stored under [`keys::INPUT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingInput {
    /// Order being fulfilled.
    pub order_id: Uuid,
    /// Organisation.
    pub org_id: String,
    /// Buyer.
    pub user_id: String,
    /// Buyer's session.
    pub session_id: String,
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from: String,
    /// Alighting stop.
    pub to: String,
    /// Passengers, one seat each.
    pub passengers: Vec<OrderPassenger>,
    /// Amount to charge, in paisa.
    pub amount_paisa: i64,
    /// ISO currency.
    pub currency: String,
    /// Payment method.
    pub payment_method: String,
    /// Contact email.
    pub contact_email: String,
    /// Contact phone.
    pub contact_phone: String,
    /// Buyer's IP.
    pub client_ip: Option<String>,
    /// A hold the buyer already took; verified instead of taking a new one.
    pub hold_id: Option<Uuid>,
    /// Hold lifetime override.
    pub hold_ttl_seconds: Option<u64>,
}

impl BookingInput {
    /// Initial context bag for a new saga.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the input cannot be encoded.
    pub fn into_context(self) -> Result<Map<String, Value>, serde_json::Error> {
        let mut context = Map::new();
        context.insert(keys::INPUT.to_string(), serde_json::to_value(self)?);
        Ok(context)
    }

    fn seat_ids(&self) -> Vec<String> {
        self.passengers.iter().map(|p| p.seat_id.clone()).collect()
    }
}

/// Build the booking saga over `caps`.
#[must_use]
pub fn booking_saga(caps: &SagaCapabilities) -> SagaDefinition {
    let identity = Arc::clone(&caps.identity);
    let verify = StepDefinition::new(steps::VERIFY_IDENTITY, move |ctx| {
        let identity = Arc::clone(&identity);
        async move { verify_identity(identity.as_ref(), &ctx).await }
    });

    let inventory = Arc::clone(&caps.inventory);
    let release = Arc::clone(&caps.inventory);
    let hold = StepDefinition::new(steps::HOLD_SEATS, move |ctx| {
        let inventory = Arc::clone(&inventory);
        async move { hold_seats(inventory.as_ref(), &ctx).await }
    })
    .with_compensation(move |ctx| {
        let inventory = Arc::clone(&release);
        async move { release_hold(inventory.as_ref(), &ctx).await }
    });

    let payments = Arc::clone(&caps.payments);
    let authorize = StepDefinition::new(steps::AUTHORIZE_PAYMENT, move |ctx| {
        let payments = Arc::clone(&payments);
        async move { authorize_payment(payments.as_ref(), &ctx).await }
    });

    let payments = Arc::clone(&caps.payments);
    let refunds = Arc::clone(&caps.payments);
    let capture = StepDefinition::new(steps::CAPTURE_PAYMENT, move |ctx| {
        let payments = Arc::clone(&payments);
        async move { capture_payment(payments.as_ref(), &ctx).await }
    })
    .with_compensation(move |ctx| {
        let payments = Arc::clone(&refunds);
        async move { refund_capture(payments.as_ref(), &ctx).await }
    });

    let inventory = Arc::clone(&caps.inventory);
    let cancel = Arc::clone(&caps.inventory);
    let confirm = StepDefinition::new(steps::CONFIRM_BOOKING, move |ctx| {
        let inventory = Arc::clone(&inventory);
        async move { confirm_booking(inventory.as_ref(), &ctx).await }
    })
    .with_compensation(move |ctx| {
        let inventory = Arc::clone(&cancel);
        async move { cancel_booking(inventory.as_ref(), &ctx).await }
    });

    let notifications = Arc::clone(&caps.notifications);
    let notify = StepDefinition::new(steps::NOTIFY, move |ctx| {
        let notifications = Arc::clone(&notifications);
        async move {
            notify_customer(notifications.as_ref(), &ctx).await;
            Ok(())
        }
    });

    SagaDefinition::new(BOOKING_SAGA)
        .step(verify)
        .step(hold)
        .step(authorize)
        .step(capture)
        .step(confirm)
        .step(notify)
}

fn input(ctx: &SagaContext) -> Result<BookingInput, StepError> {
    ctx.require(keys::INPUT)
}

fn parse_dob(raw: &str) -> Result<Option<NaiveDate>, StepError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(Some)
        .map_err(|_| {
            StepError::new(
                ErrorKind::Precondition,
                format!("invalid date of birth '{raw}'"),
            )
        })
}

async fn verify_identity(identity: &dyn NidVerifier, ctx: &SagaContext) -> Result<(), StepError> {
    let input = input(ctx)?;
    for passenger in input.passengers.iter().filter(|p| !p.nid.trim().is_empty()) {
        let request = VerifyRequest {
            nid: passenger.nid.clone(),
            name: passenger.name.clone(),
            date_of_birth: parse_dob(&passenger.date_of_birth)?,
        };
        identity.verify(&request).await?;
    }
    ctx.insert(keys::NID_VERIFIED, true)
}

async fn hold_seats(inventory: &dyn InventoryClient, ctx: &SagaContext) -> Result<(), StepError> {
    let input = input(ctx)?;

    if let Some(hold_id) = input.hold_id {
        inventory
            .verify_hold(&input.org_id, hold_id, &input.user_id)
            .await?;
        return ctx.insert(keys::HOLD_ID, hold_id);
    }

    let granted = inventory
        .hold_seats(HoldRequest {
            org_id: input.org_id.clone(),
            trip_id: input.trip_id.clone(),
            from: input.from.clone(),
            to: input.to.clone(),
            seat_ids: input.seat_ids(),
            user_id: input.user_id.clone(),
            session_id: input.session_id.clone(),
            ttl: input.hold_ttl_seconds.map(Duration::from_secs),
            client_ip: input.client_ip.clone(),
            identity_documents: input
                .passengers
                .iter()
                .filter(|p| !p.nid.is_empty())
                .map(|p| p.nid.clone())
                .collect(),
        })
        .await?;

    ctx.insert(keys::HOLD_ID, granted.hold_id)?;
    ctx.insert(keys::HOLD_EXPIRES_AT, granted.expires_at)
}

async fn release_hold(inventory: &dyn InventoryClient, ctx: &SagaContext) -> Result<(), StepError> {
    let Some(hold_id) = ctx.get::<Uuid>(keys::HOLD_ID) else {
        return Ok(());
    };
    let input = input(ctx)?;
    let released = inventory
        .release_seats(&input.org_id, hold_id, &input.user_id)
        .await?;
    if !released {
        tracing::debug!(saga_id = %ctx.saga_id(), %hold_id, "Hold already gone");
    }
    Ok(())
}

async fn authorize_payment(payments: &dyn PaymentClient, ctx: &SagaContext) -> Result<(), StepError> {
    let input = input(ctx)?;
    let authorization = payments
        .authorize(&PaymentCommand {
            order_id: input.order_id.to_string(),
            amount_paisa: input.amount_paisa,
            currency: input.currency.clone(),
            method: input.payment_method.clone(),
            customer_email: input.contact_email.clone(),
            customer_phone: input.contact_phone.clone(),
        })
        .await?;

    ctx.insert(keys::PAYMENT_ID, &authorization.payment_id)?;
    ctx.insert(keys::PAYMENT_PROVIDER, &authorization.provider)
}

async fn capture_payment(payments: &dyn PaymentClient, ctx: &SagaContext) -> Result<(), StepError> {
    let payment_id: String = ctx.require(keys::PAYMENT_ID)?;
    let provider: String = ctx.require(keys::PAYMENT_PROVIDER)?;
    payments.capture(&provider, &payment_id).await?;
    ctx.insert(keys::CAPTURED, true)
}

async fn refund_capture(payments: &dyn PaymentClient, ctx: &SagaContext) -> Result<(), StepError> {
    if ctx.get::<bool>(keys::CAPTURED) != Some(true) {
        return Ok(());
    }
    let input = input(ctx)?;
    let payment_id: String = ctx.require(keys::PAYMENT_ID)?;
    let provider: String = ctx.require(keys::PAYMENT_PROVIDER)?;

    let refund_id = payments
        .refund(&provider, &payment_id, input.amount_paisa, "booking failed")
        .await?;
    tracing::info!(
        saga_id = %ctx.saga_id(),
        order_id = %input.order_id,
        %refund_id,
        "Captured payment refunded"
    );

    ctx.insert(keys::REFUND_ID, refund_id)?;
    ctx.insert(keys::REFUND_AMOUNT, input.amount_paisa)?;
    ctx.insert(keys::CAPTURED, false)
}

async fn confirm_booking(inventory: &dyn InventoryClient, ctx: &SagaContext) -> Result<(), StepError> {
    let input = input(ctx)?;
    let hold_id: Uuid = ctx.require(keys::HOLD_ID)?;

    let confirmed = inventory
        .confirm_booking(ConfirmRequest {
            org_id: input.org_id.clone(),
            hold_id,
            order_id: input.order_id.to_string(),
            user_id: input.user_id.clone(),
            passengers: input
                .passengers
                .iter()
                .map(|p| BookingPassenger {
                    name: p.name.clone(),
                    identity_document: p.nid.clone(),
                    seat_id: p.seat_id.clone(),
                })
                .collect(),
        })
        .await?;

    ctx.insert(keys::BOOKING_ID, confirmed.booking_id)?;
    ctx.insert(keys::TICKETS, &confirmed.tickets)
}

async fn cancel_booking(inventory: &dyn InventoryClient, ctx: &SagaContext) -> Result<(), StepError> {
    let Some(booking_id) = ctx.get::<Uuid>(keys::BOOKING_ID) else {
        return Ok(());
    };
    let input = input(ctx)?;
    inventory.cancel_booking(&input.org_id, booking_id).await?;
    Ok(())
}

async fn notify_customer(notifications: &dyn NotificationClient, ctx: &SagaContext) {
    let Ok(input) = input(ctx) else {
        return;
    };
    let mut data = HashMap::new();
    if let Some(booking_id) = ctx.get::<Uuid>(keys::BOOKING_ID) {
        data.insert("booking_id".to_string(), booking_id.to_string());
    }
    if let Some(tickets) = ctx.get::<Vec<SeatTicket>>(keys::TICKETS) {
        data.insert("ticket_count".to_string(), tickets.len().to_string());
    }
    if let Some(expires) = ctx.get::<DateTime<Utc>>(keys::HOLD_EXPIRES_AT) {
        data.insert("hold_expired_at".to_string(), expires.to_rfc3339());
    }
    data.insert("trip_id".to_string(), input.trip_id.clone());

    let request = NotificationRequest {
        template: BOOKING_CONFIRMED.to_string(),
        order_id: input.order_id.to_string(),
        user_id: input.user_id.clone(),
        email: input.contact_email.clone(),
        phone: input.contact_phone.clone(),
        data,
    };
    if let Err(e) = notifications.notify(&request).await {
        tracing::warn!(
            saga_id = %ctx.saga_id(),
            order_id = %input.order_id,
            error = %e,
            "Booking notification failed"
        );
    }
}
