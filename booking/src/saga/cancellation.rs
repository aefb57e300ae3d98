//! The cancellation saga: return the seats, refund, tell the customer.
//!
//! Forward-only. A cancelled booking cannot be un-cancelled, so a refund
//! failure leaves the saga FAILED with the seats already released; the
//! order service records that as a pending refund and the saga can be
//! retried from the refund step.

use super::capabilities::{InventoryClient, NotificationClient, PaymentClient};
use super::{CANCELLATION_SAGA, SagaCapabilities, keys, steps};
use crate::notifications::{BOOKING_CANCELLED, NotificationRequest};
use seatline_runtime::saga::{SagaContext, SagaDefinition, StepDefinition, StepError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Input of the cancellation saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationInput {
    /// Order being cancelled.
    pub order_id: Uuid,
    /// Organisation.
    pub org_id: String,
    /// Buyer.
    pub user_id: String,
    /// Booking to cancel.
    pub booking_id: Uuid,
    /// Captured payment, if any.
    pub payment_id: Option<String>,
    /// Provider holding the payment.
    pub payment_provider: String,
    /// Amount to refund, in paisa.
    pub refund_amount_paisa: i64,
    /// Why.
    pub reason: String,
    /// Contact email.
    pub contact_email: String,
    /// Contact phone.
    pub contact_phone: String,
}

impl CancellationInput {
    /// Initial context bag.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the input cannot be encoded.
    pub fn into_context(self) -> Result<Map<String, Value>, serde_json::Error> {
        let mut context = Map::new();
        context.insert(keys::INPUT.to_string(), serde_json::to_value(self)?);
        Ok(context)
    }
}

/// Build the cancellation saga over `caps`.
#[must_use]
pub fn cancellation_saga(caps: &SagaCapabilities) -> SagaDefinition {
    let inventory = Arc::clone(&caps.inventory);
    let cancel = StepDefinition::new(steps::CANCEL_BOOKING, move |ctx| {
        let inventory = Arc::clone(&inventory);
        async move { cancel_booking(inventory.as_ref(), &ctx).await }
    });

    let payments = Arc::clone(&caps.payments);
    let refund = StepDefinition::new(steps::REFUND_PAYMENT, move |ctx| {
        let payments = Arc::clone(&payments);
        async move { refund_payment(payments.as_ref(), &ctx).await }
    });

    let notifications = Arc::clone(&caps.notifications);
    let notice = StepDefinition::new(steps::SEND_CANCELLATION_NOTICE, move |ctx| {
        let notifications = Arc::clone(&notifications);
        async move {
            send_notice(notifications.as_ref(), &ctx).await;
            Ok(())
        }
    });

    SagaDefinition::new(CANCELLATION_SAGA)
        .step(cancel)
        .step(refund)
        .step(notice)
        .forward_only()
}

fn input(ctx: &SagaContext) -> Result<CancellationInput, StepError> {
    ctx.require(keys::INPUT)
}

async fn cancel_booking(inventory: &dyn InventoryClient, ctx: &SagaContext) -> Result<(), StepError> {
    let input = input(ctx)?;
    let cancelled = inventory
        .cancel_booking(&input.org_id, input.booking_id)
        .await?;
    tracing::info!(
        saga_id = %ctx.saga_id(),
        booking_id = %input.booking_id,
        seats = cancelled.seat_ids.len(),
        already_cancelled = cancelled.already_cancelled,
        "Booking cancelled"
    );
    ctx.insert(keys::BOOKING_CANCELLED, true)
}

async fn refund_payment(payments: &dyn PaymentClient, ctx: &SagaContext) -> Result<(), StepError> {
    let input = input(ctx)?;
    let Some(payment_id) = input.payment_id.as_deref() else {
        return Ok(());
    };
    if input.refund_amount_paisa <= 0 || ctx.contains(keys::REFUND_ID) {
        return Ok(());
    }

    let refund_id = payments
        .refund(
            &input.payment_provider,
            payment_id,
            input.refund_amount_paisa,
            &input.reason,
        )
        .await?;

    ctx.insert(keys::REFUND_ID, refund_id)?;
    ctx.insert(keys::REFUND_AMOUNT, input.refund_amount_paisa)
}

async fn send_notice(notifications: &dyn NotificationClient, ctx: &SagaContext) {
    let Ok(input) = input(ctx) else {
        return;
    };
    let mut data = HashMap::from([
        ("booking_id".to_string(), input.booking_id.to_string()),
        ("reason".to_string(), input.reason.clone()),
    ]);
    if let Some(amount) = ctx.get::<i64>(keys::REFUND_AMOUNT) {
        data.insert("refund_amount_paisa".to_string(), amount.to_string());
    }

    let request = NotificationRequest {
        template: BOOKING_CANCELLED.to_string(),
        order_id: input.order_id.to_string(),
        user_id: input.user_id.clone(),
        email: input.contact_email.clone(),
        phone: input.contact_phone.clone(),
        data,
    };
    if let Err(e) = notifications.notify(&request).await {
        tracing::warn!(order_id = %input.order_id, error = %e, "Cancellation notice failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::saga::context_value;
    use crate::saga::fakes::Fakes;
    use seatline_core::deadline::Deadline;
    use seatline_core::saga::{SagaRecord, SagaStatus};
    use seatline_runtime::saga::{SagaOrchestrator, SagaOrchestratorConfig};
    use seatline_testing::{InMemorySagaStore, test_clock};

    fn cancellation(payment_id: Option<&str>) -> CancellationInput {
        CancellationInput {
            order_id: Uuid::new_v4(),
            org_id: "org-1".into(),
            user_id: "u1".into(),
            booking_id: Uuid::new_v4(),
            payment_id: payment_id.map(str::to_string),
            payment_provider: "sslcommerz".into(),
            refund_amount_paisa: 120_000,
            reason: "customer request".into(),
            contact_email: "rahim@example.com".into(),
            contact_phone: String::new(),
        }
    }

    fn orchestrator(fakes: &Arc<Fakes>) -> SagaOrchestrator {
        let orch = SagaOrchestrator::new(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(test_clock()),
            SagaOrchestratorConfig::default(),
        );
        orch.register(cancellation_saga(&fakes.capabilities()));
        orch
    }

    async fn run(orch: &SagaOrchestrator, input: CancellationInput) -> SagaRecord {
        let id = orch
            .create(CANCELLATION_SAGA, input.into_context().unwrap())
            .await
            .unwrap();
        orch.execute(id, Deadline::none()).await.unwrap()
    }

    #[tokio::test]
    async fn test_cancel_and_refund() {
        let fakes = Fakes::new();
        let record = run(&orchestrator(&fakes), cancellation(Some("PAY-1"))).await;

        assert_eq!(record.status, SagaStatus::Completed);
        assert_eq!(fakes.calls(), vec!["cancel", "refund", "notify"]);
        assert_eq!(context_value::<i64>(&record, keys::REFUND_AMOUNT), Some(120_000));
    }

    #[tokio::test]
    async fn test_unpaid_booking_skips_refund() {
        let fakes = Fakes::new();
        let record = run(&orchestrator(&fakes), cancellation(None)).await;

        assert_eq!(record.status, SagaStatus::Completed);
        assert!(!fakes.called("refund"));
        assert!(context_value::<String>(&record, keys::REFUND_ID).is_none());
    }

    #[tokio::test]
    async fn test_refund_failure_fails_without_undoing_cancel() {
        let fakes = Fakes::new();
        fakes.fail("refund");
        let orch = orchestrator(&fakes);
        let record = run(&orch, cancellation(Some("PAY-1"))).await;

        assert_eq!(record.status, SagaStatus::Failed);
        assert_eq!(context_value::<bool>(&record, keys::BOOKING_CANCELLED), Some(true));
        assert!(!fakes.called("notify"));

        fakes.failing.lock().unwrap().clear();
        let retried = orch.retry(record.saga_id, Deadline::none()).await.unwrap();
        assert_eq!(retried.status, SagaStatus::Completed);
        assert_eq!(context_value::<String>(&retried, keys::REFUND_ID).as_deref(), Some("RF-1"));
    }
}
