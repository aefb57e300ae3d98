//! Order service.

use super::pricing::{CURRENCY, Totals};
use super::{OrderError, SeatPricing};
use crate::entitlement::{EntitlementChecker, MAX_BOOKINGS_PER_MONTH};
use crate::identity::{normalize_nid, validate_nid_format};
use crate::saga::{
    BOOKING_SAGA, BookingInput, CANCELLATION_SAGA, CancellationInput, context_value, keys,
};
use chrono::{DateTime, Utc};
use seatline_core::deadline::Deadline;
use seatline_core::environment::Clock;
use seatline_core::event::{event_types, topics};
use seatline_core::inventory::SeatTicket;
use seatline_core::order::{
    BookedSeat, InsertOutcome, Order, OrderPassenger, OrderRepository, OrderStatus, PaymentStatus,
};
use seatline_core::outbox::OutboxEntry;
use seatline_core::saga::{SagaRecord, SagaStatus};
use seatline_runtime::saga::{SagaError, SagaOrchestrator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

/// Page size when the caller gives none.
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Largest page served.
pub const MAX_PAGE_SIZE: usize = 100;

/// Failure reason recorded on orders and sagas closed by expiry.
pub const ORDER_EXPIRED_REASON: &str = "order expired before payment";

/// Order service tuning.
#[derive(Debug, Clone)]
pub struct OrderServiceConfig {
    /// Payment window.
    pub order_ttl: Duration,
    /// Bound on a background booking saga run.
    pub booking_timeout: Duration,
}

impl Default for OrderServiceConfig {
    fn default() -> Self {
        Self {
            order_ttl: super::ORDER_TTL,
            booking_timeout: Duration::from_secs(120),
        }
    }
}

/// A new order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOrderRequest {
    /// Tenant.
    pub organization_id: String,
    /// Buyer.
    pub user_id: String,
    /// Buyer's session.
    pub session_id: String,
    /// Trip.
    pub trip_id: String,
    /// Boarding stop.
    pub from_station_id: String,
    /// Alighting stop.
    pub to_station_id: String,
    /// One per seat.
    pub passengers: Vec<OrderPassenger>,
    /// `card`, `bkash`, `nagad`, ...
    pub payment_method: String,
    /// Contact email.
    pub contact_email: String,
    /// Contact phone.
    pub contact_phone: String,
    /// A hold the buyer already took.
    pub hold_id: Option<Uuid>,
    /// Discount in paisa.
    pub discount_paisa: i64,
    /// Client deduplication key.
    pub idempotency_key: Option<String>,
    /// Buyer's IP.
    pub client_ip: Option<String>,
}

/// A cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    /// Tenant.
    pub organization_id: String,
    /// Caller; must own the order.
    pub user_id: String,
    /// Order.
    pub order_id: Uuid,
    /// Why.
    pub reason: String,
}

/// One page of a user's orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPage {
    /// Newest first.
    pub orders: Vec<Order>,
    /// Token for the next page, if any.
    pub next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct SagaSubject {
    order_id: Uuid,
    #[serde(default)]
    reason: String,
}

/// Creates orders and settles them from saga outcomes.
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    orchestrator: Arc<SagaOrchestrator>,
    pricing: Arc<dyn SeatPricing>,
    entitlements: Option<Arc<EntitlementChecker>>,
    clock: Arc<dyn Clock>,
    config: OrderServiceConfig,
}

impl OrderService {
    /// Create a service. The orchestrator must have the booking and
    /// cancellation sagas registered.
    #[must_use]
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        orchestrator: Arc<SagaOrchestrator>,
        pricing: Arc<dyn SeatPricing>,
        clock: Arc<dyn Clock>,
        config: OrderServiceConfig,
    ) -> Self {
        Self {
            orders,
            orchestrator,
            pricing,
            entitlements: None,
            clock,
            config,
        }
    }

    /// Gate order creation on the organisation's monthly booking quota.
    #[must_use]
    pub fn with_entitlements(mut self, checker: Arc<EntitlementChecker>) -> Self {
        self.entitlements = Some(checker);
        self
    }

    /// Place an order and run its booking saga in the background.
    ///
    /// Returns the order as persisted, normally `pending`. A repeated
    /// idempotency key returns the original order and starts nothing.
    ///
    /// # Errors
    ///
    /// See [`place_order`](Self::place_order).
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
        deadline: Deadline,
    ) -> Result<Order, OrderError> {
        let (order, is_new) = self.place_order(request, deadline).await?;
        if is_new {
            let service = self.clone();
            let order_id = order.id;
            let span = tracing::info_span!("booking_saga", %order_id);
            tokio::spawn(
                async move {
                    let deadline = Deadline::after(service.config.booking_timeout);
                    if let Err(e) = service.complete_booking(order_id, deadline).await {
                        tracing::error!(error = %e, "Booking did not settle");
                    }
                }
                .instrument(span),
            );
        }
        Ok(order)
    }

    /// Validate, price and persist an order and create its booking saga,
    /// without running it. The flag is false when an existing order was
    /// returned for the idempotency key.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] for malformed requests
    /// - [`OrderError::Entitlement`] when the organisation is over quota
    /// - [`OrderError::Inventory`] for unknown trips, seats or stations
    /// - [`OrderError::Store`] / [`OrderError::Saga`] on persistence failures
    pub async fn place_order(
        &self,
        request: CreateOrderRequest,
        deadline: Deadline,
    ) -> Result<(Order, bool), OrderError> {
        validate(&request)?;

        if let Some(key) = request.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            if let Some(existing) = self
                .orders
                .find_by_idempotency_key(&request.organization_id, key)
                .await?
            {
                tracing::debug!(order_id = %existing.id, "Order replayed for idempotency key");
                return Ok((existing, false));
            }
        }

        if let Some(checker) = &self.entitlements {
            checker
                .check_quota(&request.organization_id, MAX_BOOKINGS_PER_MONTH, 1)
                .await?;
        }

        let seat_ids: Vec<String> = request
            .passengers
            .iter()
            .map(|p| p.seat_id.clone())
            .collect();
        let specs = self
            .pricing
            .quote(
                &request.organization_id,
                &request.trip_id,
                &request.from_station_id,
                &request.to_station_id,
                &seat_ids,
                deadline,
            )
            .await?;
        let subtotal: i64 = specs.iter().map(|s| s.price_paisa).sum();
        let totals = Totals::compute(subtotal, request.passengers.len(), request.discount_paisa);

        let now = self.clock.now();
        let order_id = Uuid::new_v4();
        let input = BookingInput {
            order_id,
            org_id: request.organization_id.clone(),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            trip_id: request.trip_id.clone(),
            from: request.from_station_id.clone(),
            to: request.to_station_id.clone(),
            passengers: request.passengers.clone(),
            amount_paisa: totals.total_paisa,
            currency: CURRENCY.to_string(),
            payment_method: request.payment_method.clone(),
            contact_email: request.contact_email.clone(),
            contact_phone: request.contact_phone.clone(),
            client_ip: request.client_ip.clone(),
            hold_id: request.hold_id,
            hold_ttl_seconds: None,
        };
        let saga_id = self
            .orchestrator
            .create(BOOKING_SAGA, input.into_context()?)
            .await?;

        let ttl = chrono::Duration::from_std(self.config.order_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let order = Order {
            id: order_id,
            organization_id: request.organization_id,
            user_id: request.user_id,
            trip_id: request.trip_id,
            from_station_id: request.from_station_id,
            to_station_id: request.to_station_id,
            passengers: request.passengers,
            subtotal_paisa: totals.subtotal_paisa,
            tax_paisa: totals.tax_paisa,
            booking_fee_paisa: totals.booking_fee_paisa,
            discount_paisa: totals.discount_paisa,
            total_paisa: totals.total_paisa,
            currency: CURRENCY.to_string(),
            payment_id: None,
            payment_status: PaymentStatus::Pending,
            payment_method: request.payment_method,
            booking_id: None,
            hold_id: request.hold_id,
            seats: specs
                .iter()
                .map(|s| BookedSeat {
                    seat_id: s.seat_id.clone(),
                    seat_number: s.number.clone(),
                    seat_class: s.class.as_str().to_string(),
                    ticket_id: None,
                    price_paisa: s.price_paisa,
                })
                .collect(),
            status: OrderStatus::Pending,
            saga_id: Some(saga_id),
            contact_email: request.contact_email,
            contact_phone: request.contact_phone,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            idempotency_key: request.idempotency_key,
        };

        let event = order_event(
            order.id,
            event_types::ORDER_CREATED,
            serde_json::to_value(&order)?,
            now,
        );
        match self.orders.insert(&order, &event).await? {
            InsertOutcome::Inserted => {
                tracing::info!(
                    order_id = %order.id,
                    %saga_id,
                    total_paisa = order.total_paisa,
                    "Order created"
                );
                Ok((order, true))
            }
            InsertOutcome::Duplicate(existing) => {
                tracing::debug!(
                    order_id = %existing.id,
                    %saga_id,
                    "Idempotency key raced; closing unused saga"
                );
                if let Err(e) = self
                    .orchestrator
                    .abandon(saga_id, "idempotency key already used")
                    .await
                {
                    tracing::warn!(%saga_id, error = %e, "Failed to close unused saga");
                }
                Ok((*existing, false))
            }
        }
    }

    /// Run a pending order's booking saga and record the outcome.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`], [`OrderError::Saga`] or [`OrderError::Store`].
    pub async fn complete_booking(
        &self,
        order_id: Uuid,
        deadline: Deadline,
    ) -> Result<Order, OrderError> {
        let order = self.load(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Ok(order);
        }
        let Some(saga_id) = order.saga_id else {
            return Err(OrderError::InvalidState {
                order_id,
                status: order.status.as_str(),
            });
        };
        let record = self.orchestrator.execute(saga_id, deadline).await?;
        self.settle_booking(order, &record).await
    }

    /// Retry a failed or stuck saga and reflect a new outcome on its order.
    ///
    /// # Errors
    ///
    /// [`OrderError::Saga`] if the saga is unknown, running or not retryable.
    pub async fn retry_saga(
        &self,
        saga_id: Uuid,
        deadline: Deadline,
    ) -> Result<SagaRecord, OrderError> {
        let record = self.orchestrator.retry(saga_id, deadline).await?;
        self.reconcile(&record).await?;
        Ok(record)
    }

    /// Find sagas interrupted by a crash. With `auto_resume` they are resumed
    /// and their orders settled; otherwise they wait for [`retry_saga`](Self::retry_saga).
    /// Returns the interrupted saga ids.
    ///
    /// # Errors
    ///
    /// [`OrderError::Saga`] if the interrupted sagas cannot be listed.
    pub async fn recover_sagas(
        &self,
        auto_resume: bool,
        deadline: Deadline,
    ) -> Result<Vec<Uuid>, OrderError> {
        let interrupted = self.orchestrator.recover(auto_resume, deadline).await?;
        if auto_resume {
            for saga_id in &interrupted {
                let settled = match self.orchestrator.get(*saga_id).await {
                    Ok(record) => self.reconcile(&record).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = settled {
                    tracing::error!(%saga_id, error = %e, "Resumed saga left its order unsettled");
                }
            }
        }
        Ok(interrupted)
    }

    /// Expire up to `limit` `pending` orders whose payment window closed.
    ///
    /// An order whose booking saga never started is marked `expired` and its
    /// saga closed. A saga that already finished settles its order instead; a
    /// running one is left to saga recovery. Returns the number expired.
    ///
    /// # Errors
    ///
    /// [`OrderError::Store`] if the due orders cannot be listed.
    pub async fn expire_orders(&self, limit: usize) -> Result<usize, OrderError> {
        let due = self.orders.expired_pending(self.clock.now(), limit).await?;

        let mut expired = 0;
        for order in due {
            let order_id = order.id;
            match self.expire_order(order).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(%order_id, error = %e, "Failed to expire order"),
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expired orders closed");
        }
        Ok(expired)
    }

    async fn expire_order(&self, mut order: Order) -> Result<bool, OrderError> {
        let mut saga_state = None;
        if let Some(saga_id) = order.saga_id {
            match self.orchestrator.abandon(saga_id, ORDER_EXPIRED_REASON).await {
                Ok(true) => saga_state = Some(SagaStatus::Compensated.as_str()),
                Ok(false) => {
                    let record = self.orchestrator.get(saga_id).await?;
                    if record.status.is_terminal() {
                        self.settle_booking(order, &record).await?;
                    } else {
                        tracing::debug!(
                            order_id = %order.id,
                            %saga_id,
                            status = %record.status,
                            "Expired order still has a live saga"
                        );
                    }
                    return Ok(false);
                }
                Err(SagaError::AlreadyRunning(_)) => return Ok(false),
                Err(SagaError::NotFound(_)) => {
                    tracing::warn!(order_id = %order.id, %saga_id, "Expired order lost its saga");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = self.clock.now();
        order.status = OrderStatus::Expired;
        order.updated_at = now;
        let event = order_event(
            order.id,
            event_types::ORDER_FAILED,
            json!({
                "order_id": order.id,
                "reason": ORDER_EXPIRED_REASON,
                "saga_state": saga_state,
            }),
            now,
        );
        self.orders.update(&order, Some(&event)).await?;
        tracing::info!(order_id = %order.id, "Order expired");
        Ok(true)
    }

    /// Reflect a saga's terminal state on its order, if the order still
    /// waits for it.
    async fn reconcile(&self, record: &SagaRecord) -> Result<(), OrderError> {
        let Some(subject) = context_value::<SagaSubject>(record, keys::INPUT) else {
            return Ok(());
        };
        let Some(order) = self.orders.get(subject.order_id).await? else {
            return Ok(());
        };

        match record.name.as_str() {
            BOOKING_SAGA
                if order.status == OrderStatus::Pending
                    || (order.status == OrderStatus::Failed
                        && record.status == SagaStatus::Completed) =>
            {
                self.settle_booking(order, record).await?;
            }
            CANCELLATION_SAGA if order.status == OrderStatus::RefundPending => {
                self.settle_cancellation(order, record, &subject.reason)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// An order of the organisation.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`] if it does not exist or belongs elsewhere.
    pub async fn get_order(
        &self,
        organization_id: &str,
        order_id: Uuid,
    ) -> Result<Order, OrderError> {
        let order = self.load(order_id).await?;
        if order.organization_id != organization_id {
            return Err(OrderError::NotFound(order_id));
        }
        Ok(order)
    }

    /// A user's orders, newest first.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] for a malformed page token.
    pub async fn list_orders(
        &self,
        organization_id: &str,
        user_id: &str,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<OrderPage, OrderError> {
        let limit = match page_size {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        };
        let offset = match page_token.filter(|t| !t.is_empty()) {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| OrderError::Validation(format!("invalid page token '{token}'")))?,
        };

        let mut orders = self
            .orders
            .list_for_user(organization_id, user_id, limit + 1, offset)
            .await?;
        let next_page_token = (orders.len() > limit).then(|| (offset + limit).to_string());
        orders.truncate(limit);
        Ok(OrderPage {
            orders,
            next_page_token,
        })
    }

    /// Cancel a confirmed order: release its seats and refund the payment.
    ///
    /// The result is `refunded` (or `cancelled` when nothing was captured). If
    /// the seats were released but the refund failed the order becomes
    /// `refund_pending` and the cancellation saga can be retried.
    ///
    /// # Errors
    ///
    /// - [`OrderError::NotFound`] for unknown orders or another user's order
    /// - [`OrderError::InvalidState`] unless the order is `confirmed`
    /// - [`OrderError::CancellationFailed`] if the booking could not be cancelled
    pub async fn cancel_order(
        &self,
        request: CancelOrderRequest,
        deadline: Deadline,
    ) -> Result<Order, OrderError> {
        let order = self
            .get_order(&request.organization_id, request.order_id)
            .await?;
        if order.user_id != request.user_id {
            return Err(OrderError::NotFound(order.id));
        }
        let (OrderStatus::Confirmed, Some(booking_id)) = (order.status, order.booking_id) else {
            return Err(OrderError::InvalidState {
                order_id: order.id,
                status: order.status.as_str(),
            });
        };

        let reason = if request.reason.trim().is_empty() {
            "customer request".to_string()
        } else {
            request.reason
        };
        let captured = order.payment_status == PaymentStatus::Captured;
        let input = CancellationInput {
            order_id: order.id,
            org_id: order.organization_id.clone(),
            user_id: order.user_id.clone(),
            booking_id,
            payment_id: order.payment_id.clone().filter(|_| captured),
            payment_provider: self.payment_provider(&order).await,
            refund_amount_paisa: if captured { order.total_paisa } else { 0 },
            reason: reason.clone(),
            contact_email: order.contact_email.clone(),
            contact_phone: order.contact_phone.clone(),
        };

        let saga_id = self
            .orchestrator
            .create(CANCELLATION_SAGA, input.into_context()?)
            .await?;
        let record = self.orchestrator.execute(saga_id, deadline).await?;
        self.settle_cancellation(order, &record, &reason).await
    }

    async fn load(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.orders
            .get(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Provider that took the payment, from the booking saga.
    async fn payment_provider(&self, order: &Order) -> String {
        let recorded = match order.saga_id {
            Some(saga_id) => self
                .orchestrator
                .get(saga_id)
                .await
                .ok()
                .and_then(|r| context_value::<String>(&r, keys::PAYMENT_PROVIDER)),
            None => None,
        };
        recorded.unwrap_or_else(|| order.payment_method.clone())
    }

    async fn settle_booking(
        &self,
        mut order: Order,
        record: &SagaRecord,
    ) -> Result<Order, OrderError> {
        let now = self.clock.now();
        let event = match record.status {
            SagaStatus::Completed => {
                let tickets: Vec<SeatTicket> =
                    context_value(record, keys::TICKETS).unwrap_or_default();
                for seat in &mut order.seats {
                    seat.ticket_id = tickets
                        .iter()
                        .find(|t| t.seat_id == seat.seat_id)
                        .map(|t| t.ticket_id);
                }
                if context_value::<bool>(record, keys::NID_VERIFIED) == Some(true) {
                    for passenger in &mut order.passengers {
                        passenger.nid_verified = !passenger.nid.is_empty();
                    }
                }
                order.status = OrderStatus::Confirmed;
                order.payment_status = PaymentStatus::Captured;
                order.payment_id = context_value(record, keys::PAYMENT_ID);
                order.booking_id = context_value(record, keys::BOOKING_ID);
                order.hold_id = context_value(record, keys::HOLD_ID).or(order.hold_id);

                order_event(
                    order.id,
                    event_types::ORDER_CONFIRMED,
                    json!({
                        "order_id": order.id,
                        "booking_id": order.booking_id,
                        "payment_id": order.payment_id,
                        "total_paisa": order.total_paisa,
                        "currency": order.currency,
                        "seats": order.seats,
                    }),
                    now,
                )
            }
            SagaStatus::Compensated | SagaStatus::Failed => {
                let refunded = context_value::<String>(record, keys::REFUND_ID).is_some();
                order.status = OrderStatus::Failed;
                order.payment_id = context_value(record, keys::PAYMENT_ID);
                order.payment_status = if refunded {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::Failed
                };
                let reason = record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "booking failed".to_string());

                order_event(
                    order.id,
                    event_types::ORDER_FAILED,
                    json!({
                        "order_id": order.id,
                        "reason": reason,
                        "saga_state": record.status.as_str(),
                    }),
                    now,
                )
            }
            _ => return Ok(order),
        };

        order.updated_at = now;
        self.orders.update(&order, Some(&event)).await?;
        tracing::info!(
            order_id = %order.id,
            status = order.status.as_str(),
            saga_status = %record.status,
            "Order settled"
        );
        Ok(order)
    }

    async fn settle_cancellation(
        &self,
        mut order: Order,
        record: &SagaRecord,
        reason: &str,
    ) -> Result<Order, OrderError> {
        let cancelled = context_value::<bool>(record, keys::BOOKING_CANCELLED) == Some(true);
        let refund_id: Option<String> = context_value(record, keys::REFUND_ID);
        let refund_amount: i64 = context_value(record, keys::REFUND_AMOUNT).unwrap_or(0);

        match (record.status, cancelled) {
            (SagaStatus::Completed, _) if refund_id.is_some() => {
                order.status = OrderStatus::Refunded;
                order.payment_status = PaymentStatus::Refunded;
            }
            (SagaStatus::Completed, _) => order.status = OrderStatus::Cancelled,
            (_, true) => order.status = OrderStatus::RefundPending,
            _ => {
                return Err(OrderError::CancellationFailed(
                    record
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("cancellation saga {}", record.status)),
                ));
            }
        }

        let now = self.clock.now();
        order.updated_at = now;
        let event = order_event(
            order.id,
            event_types::ORDER_CANCELLED,
            json!({
                "order_id": order.id,
                "booking_id": order.booking_id,
                "saga_id": record.saga_id,
                "status": order.status.as_str(),
                "refund_id": refund_id,
                "refund_amount": refund_amount,
                "reason": reason,
            }),
            now,
        );
        self.orders.update(&order, Some(&event)).await?;
        tracing::info!(
            order_id = %order.id,
            status = order.status.as_str(),
            "Order cancelled"
        );
        Ok(order)
    }
}

fn order_event(
    order_id: Uuid,
    event_type: &str,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> OutboxEntry {
    OutboxEntry::new(topics::ORDERS, event_type, order_id.to_string(), payload, now)
}

fn validate(request: &CreateOrderRequest) -> Result<(), OrderError> {
    let required = [
        ("organization_id", &request.organization_id),
        ("user_id", &request.user_id),
        ("trip_id", &request.trip_id),
        ("from_station_id", &request.from_station_id),
        ("to_station_id", &request.to_station_id),
        ("payment_method", &request.payment_method),
    ];
    if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(OrderError::Validation(format!("{field} is required")));
    }
    if request.passengers.is_empty() {
        return Err(OrderError::Validation(
            "at least one passenger is required".to_string(),
        ));
    }
    if request.discount_paisa < 0 {
        return Err(OrderError::Validation(
            "discount cannot be negative".to_string(),
        ));
    }

    let mut seats = HashSet::new();
    for (i, passenger) in request.passengers.iter().enumerate() {
        if passenger.name.trim().is_empty() {
            return Err(OrderError::Validation(format!(
                "passenger {i}: name is required"
            )));
        }
        if passenger.seat_id.trim().is_empty() {
            return Err(OrderError::Validation(format!(
                "passenger {i}: seat_id is required"
            )));
        }
        if !seats.insert(passenger.seat_id.as_str()) {
            return Err(OrderError::Validation(format!(
                "seat {} requested twice",
                passenger.seat_id
            )));
        }
        if !passenger.nid.trim().is_empty() {
            validate_nid_format(&normalize_nid(&passenger.nid))
                .map_err(|e| OrderError::Validation(format!("passenger {i}: {e}")))?;
        }
    }
    Ok(())
}
