//! Concrete components behind the saga capabilities.
//!
//! Each adapter owns an `Arc` of one component and translates its errors
//! into [`StepError`]s carrying the component's error kind, which decides
//! whether the orchestrator compensates or the edge retries.

use crate::identity::{IdentityProvider, VerifyRequest, normalize_nid, validate_nid_format};
use crate::inventory::{
    CancelledBooking, ConfirmRequest, ConfirmedBooking, HoldGranted, HoldRequest, InventoryEngine,
    InventoryError,
};
use crate::notifications::{NotificationRequest, OutboxNotifier};
use crate::orders::{PricingFuture, SeatPricing};
use crate::payments::{CreatePaymentRequest, PaymentProvider, PaymentRegistry, PaymentState};
use crate::saga::{
    Authorization, CapabilityFuture, InventoryClient, NidVerifier, NotificationClient,
    PaymentClient, PaymentCommand,
};
use seatline_core::deadline::Deadline;
use seatline_core::environment::Clock;
use seatline_core::error::ErrorKind;
use seatline_runtime::saga::StepError;
use std::sync::Arc;
use uuid::Uuid;

/// Engine calls made from saga steps are bounded by the step timeout.
const STEP_BOUNDED: Deadline = Deadline::none();

/// [`InventoryClient`] over the in-process engine.
#[derive(Clone)]
pub struct EngineInventory {
    engine: Arc<InventoryEngine>,
}

impl EngineInventory {
    /// Adapter over `engine`.
    #[must_use]
    pub const fn new(engine: Arc<InventoryEngine>) -> Self {
        Self { engine }
    }
}

impl InventoryClient for EngineInventory {
    fn hold_seats(&self, request: HoldRequest) -> CapabilityFuture<'_, HoldGranted> {
        Box::pin(async move {
            self.engine
                .hold_seats(request, STEP_BOUNDED)
                .await
                .map_err(|e| StepError::from_err(&e))
        })
    }

    fn verify_hold<'a>(
        &'a self,
        org_id: &'a str,
        hold_id: Uuid,
        user_id: &'a str,
    ) -> CapabilityFuture<'a, ()> {
        Box::pin(async move {
            self.engine
                .verify_hold(org_id, hold_id, user_id, STEP_BOUNDED)
                .await
                .map(|_| ())
                .map_err(|e| StepError::from_err(&e))
        })
    }

    fn release_seats<'a>(
        &'a self,
        org_id: &'a str,
        hold_id: Uuid,
        user_id: &'a str,
    ) -> CapabilityFuture<'a, bool> {
        Box::pin(async move {
            match self
                .engine
                .release_seats(org_id, hold_id, user_id, STEP_BOUNDED)
                .await
            {
                Ok(_) => Ok(true),
                // Expired holds have already been reaped.
                Err(InventoryError::HoldExpired(_) | InventoryError::HoldNotFound(_)) => Ok(false),
                Err(e) => Err(StepError::from_err(&e)),
            }
        })
    }

    fn confirm_booking(&self, request: ConfirmRequest) -> CapabilityFuture<'_, ConfirmedBooking> {
        Box::pin(async move {
            self.engine
                .confirm_booking(request, STEP_BOUNDED)
                .await
                .map_err(|e| StepError::from_err(&e))
        })
    }

    fn cancel_booking<'a>(
        &'a self,
        org_id: &'a str,
        booking_id: Uuid,
    ) -> CapabilityFuture<'a, CancelledBooking> {
        Box::pin(async move {
            self.engine
                .cancel_booking(org_id, booking_id, STEP_BOUNDED)
                .await
                .map_err(|e| StepError::from_err(&e))
        })
    }
}

impl SeatPricing for InventoryEngine {
    fn quote<'a>(
        &'a self,
        org_id: &'a str,
        trip_id: &'a str,
        from: &'a str,
        to: &'a str,
        seat_ids: &'a [String],
        deadline: Deadline,
    ) -> PricingFuture<'a> {
        Box::pin(async move {
            Self::quote(self, org_id, trip_id, from, to, seat_ids, deadline).await
        })
    }
}

/// [`PaymentClient`] over the provider registry.
#[derive(Clone)]
pub struct RegistryPayments {
    registry: Arc<PaymentRegistry>,
}

impl RegistryPayments {
    /// Adapter over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<PaymentRegistry>) -> Self {
        Self { registry }
    }

    /// A provider by name, or by payment method for orders that predate the
    /// provider being recorded.
    fn provider(&self, name: &str) -> Result<Arc<dyn PaymentProvider>, StepError> {
        self.registry
            .provider(name)
            .or_else(|_| self.registry.provider_for_method(name))
            .map_err(|e| StepError::from_err(&e))
    }
}

impl PaymentClient for RegistryPayments {
    fn authorize<'a>(&'a self, command: &'a PaymentCommand) -> CapabilityFuture<'a, Authorization> {
        Box::pin(async move {
            let name = self.registry.resolve_provider(&command.method);
            let provider = self.provider(&name)?;
            let created = provider
                .create_payment(&CreatePaymentRequest {
                    order_id: command.order_id.clone(),
                    amount_paisa: command.amount_paisa,
                    currency: command.currency.clone(),
                    customer_email: command.customer_email.clone(),
                    customer_phone: command.customer_phone.clone(),
                    description: format!("Order {}", command.order_id),
                    ..CreatePaymentRequest::default()
                })
                .await
                .map_err(|e| StepError::from_err(&e))?;

            let state = match created.status {
                PaymentState::Pending | PaymentState::Processing => {
                    provider
                        .verify_payment(&created.transaction_id)
                        .await
                        .map_err(|e| StepError::from_err(&e))?
                        .status
                }
                other => other,
            };
            match state {
                PaymentState::Authorized | PaymentState::Captured => Ok(Authorization {
                    payment_id: created.transaction_id,
                    provider: name,
                }),
                PaymentState::Pending | PaymentState::Processing => Err(StepError::new(
                    ErrorKind::Transient,
                    format!("payment {} not yet authorized", created.transaction_id),
                )),
                other => Err(StepError::new(
                    ErrorKind::Permanent,
                    format!("payment {} {}", created.transaction_id, other.as_str()),
                )),
            }
        })
    }

    fn capture<'a>(&'a self, provider: &'a str, payment_id: &'a str) -> CapabilityFuture<'a, ()> {
        Box::pin(async move {
            let status = self
                .provider(provider)?
                .capture_payment(payment_id)
                .await
                .map_err(|e| StepError::from_err(&e))?;
            if status.status == PaymentState::Captured {
                Ok(())
            } else {
                Err(StepError::new(
                    ErrorKind::Permanent,
                    status
                        .failure_reason
                        .unwrap_or_else(|| format!("capture left payment {}", status.status.as_str())),
                ))
            }
        })
    }

    fn refund<'a>(
        &'a self,
        provider: &'a str,
        payment_id: &'a str,
        amount_paisa: i64,
        reason: &'a str,
    ) -> CapabilityFuture<'a, String> {
        Box::pin(async move {
            self.provider(provider)?
                .refund_payment(payment_id, amount_paisa, reason)
                .await
                .map(|r| r.refund_id)
                .map_err(|e| StepError::from_err(&e))
        })
    }
}

/// [`NidVerifier`] over an identity provider.
#[derive(Clone)]
pub struct IdentityVerifier {
    provider: Arc<dyn IdentityProvider>,
}

impl IdentityVerifier {
    /// Adapter over `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }
}

impl NidVerifier for IdentityVerifier {
    fn verify<'a>(&'a self, request: &'a VerifyRequest) -> CapabilityFuture<'a, ()> {
        Box::pin(async move {
            let nid = normalize_nid(&request.nid);
            validate_nid_format(&nid).map_err(|e| StepError::from_err(&e))?;
            let normalized = VerifyRequest {
                nid,
                ..request.clone()
            };
            let response = self
                .provider
                .verify(&normalized)
                .await
                .and_then(crate::identity::VerifyResponse::into_result)
                .map_err(|e| StepError::from_err(&e))?;
            tracing::debug!(
                provider = %response.provider_name,
                confidence = response.confidence,
                "Identity verified"
            );
            Ok(())
        })
    }
}

/// [`NotificationClient`] writing to the outbox.
#[derive(Clone)]
pub struct OutboxNotifications {
    notifier: OutboxNotifier,
    clock: Arc<dyn Clock>,
}

impl OutboxNotifications {
    /// Adapter over `notifier`.
    #[must_use]
    pub fn new(notifier: OutboxNotifier, clock: Arc<dyn Clock>) -> Self {
        Self { notifier, clock }
    }
}

impl NotificationClient for OutboxNotifications {
    fn notify<'a>(&'a self, request: &'a NotificationRequest) -> CapabilityFuture<'a, ()> {
        Box::pin(async move {
            self.notifier
                .request(request, self.clock.now())
                .await
                .map_err(|e| StepError::from_err(&e))
        })
    }
}
