//! Sandbox providers.
//!
//! A sandbox provider keeps its transactions in memory and authorises every
//! positive amount immediately. Failures can be injected for tests and
//! rehearsals.

use super::{
    CreatePaymentRequest, CreatePaymentResponse, IpnData, PaymentError, PaymentFuture,
    PaymentProvider, PaymentState, PaymentStatus, ProviderFactory, RefundResponse,
};
use rand::Rng;
use seatline_core::environment::{Clock, SystemClock};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Builds sandbox providers for one provider name.
#[derive(Debug, Clone, Copy)]
pub struct SandboxFactory {
    name: &'static str,
    order_id_field: &'static str,
}

impl SandboxFactory {
    /// SSLCommerz: callbacks carry `tran_id`.
    #[must_use]
    pub const fn sslcommerz() -> Self {
        Self {
            name: "sslcommerz",
            order_id_field: "tran_id",
        }
    }

    /// bKash: callbacks carry `merchantInvoiceNumber`.
    #[must_use]
    pub const fn bkash() -> Self {
        Self {
            name: "bkash",
            order_id_field: "merchantInvoiceNumber",
        }
    }

    /// Nagad: callbacks carry `order_id`.
    #[must_use]
    pub const fn nagad() -> Self {
        Self {
            name: "nagad",
            order_id_field: "order_id",
        }
    }

    /// Provider name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl ProviderFactory for SandboxFactory {
    fn create(
        &self,
        credentials: &serde_json::Value,
        sandbox: bool,
    ) -> Result<Arc<dyn PaymentProvider>, PaymentError> {
        if !sandbox {
            return Err(PaymentError::InvalidCredentials {
                provider: self.name.to_string(),
                reason: "live mode needs a provider integration; only sandbox is available"
                    .to_string(),
            });
        }
        if !(credentials.is_null() || credentials.is_object()) {
            return Err(PaymentError::InvalidCredentials {
                provider: self.name.to_string(),
                reason: "credentials must be a JSON object".to_string(),
            });
        }
        Ok(Arc::new(SandboxProvider::new(self.name, Arc::new(SystemClock))))
    }

    fn parse_order_id(&self, payload: &HashMap<String, String>) -> Result<String, PaymentError> {
        payload
            .get(self.order_id_field)
            .cloned()
            .ok_or(PaymentError::MissingField(self.order_id_field))
    }
}

struct Transaction {
    order_id: String,
    status: PaymentStatus,
}

/// In-memory provider.
pub struct SandboxProvider {
    name: String,
    clock: Arc<dyn Clock>,
    ledger: Mutex<HashMap<String, Transaction>>,
    declines: AtomicUsize,
    capture_failures: AtomicUsize,
    refund_failures: AtomicUsize,
}

impl SandboxProvider {
    /// A provider registered as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            ledger: Mutex::new(HashMap::new()),
            declines: AtomicUsize::new(0),
            capture_failures: AtomicUsize::new(0),
            refund_failures: AtomicUsize::new(0),
        }
    }

    /// Decline the next `n` payment creations.
    pub fn decline_next(&self, n: usize) {
        self.declines.store(n, Ordering::SeqCst);
    }

    /// Refuse the next `n` captures.
    pub fn fail_next_captures(&self, n: usize) {
        self.capture_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` refunds as unreachable.
    pub fn fail_next_refunds(&self, n: usize) {
        self.refund_failures.store(n, Ordering::SeqCst);
    }

    /// State of a transaction.
    #[must_use]
    pub fn state(&self, transaction_id: &str) -> Option<PaymentState> {
        self.ledger()
            .get(transaction_id)
            .map(|t| t.status.status)
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, HashMap<String, Transaction>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prefix(&self) -> String {
        self.name.chars().take(3).collect::<String>().to_uppercase()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Deserialize)]
struct IpnPayload {
    transaction_id: String,
    status: PaymentState,
    amount_paisa: i64,
}

impl PaymentProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_payment<'a>(
        &'a self,
        request: &'a CreatePaymentRequest,
    ) -> PaymentFuture<'a, CreatePaymentResponse> {
        Box::pin(async move {
            if request.amount_paisa <= 0 {
                return Err(PaymentError::Declined("amount must be positive".to_string()));
            }
            if take_one(&self.declines) {
                return Err(PaymentError::Declined("card declined".to_string()));
            }

            let now = self.clock.now();
            let transaction_id = format!("{}-{}", self.prefix(), Uuid::new_v4().simple());
            let gateway_ref = format!("SBX{}", Uuid::new_v4().simple());
            let status = PaymentStatus {
                transaction_id: transaction_id.clone(),
                gateway_ref: gateway_ref.clone(),
                status: PaymentState::Authorized,
                amount_paisa: request.amount_paisa,
                currency: request.currency.clone(),
                bank_tran_id: None,
                failure_reason: None,
                processed_at: now,
            };
            self.ledger().insert(
                transaction_id.clone(),
                Transaction {
                    order_id: request.order_id.clone(),
                    status,
                },
            );

            tracing::debug!(
                provider = %self.name,
                transaction_id,
                order_id = %request.order_id,
                amount_paisa = request.amount_paisa,
                "Sandbox payment authorized"
            );

            Ok(CreatePaymentResponse {
                session_id: transaction_id.clone(),
                redirect_url: format!("sandbox://{}/checkout/{transaction_id}", self.name),
                transaction_id,
                gateway_ref,
                expires_at: now + chrono::Duration::minutes(15),
                status: PaymentState::Authorized,
            })
        })
    }

    fn verify_payment<'a>(&'a self, transaction_id: &'a str) -> PaymentFuture<'a, PaymentStatus> {
        Box::pin(async move {
            self.ledger()
                .get(transaction_id)
                .map(|t| t.status.clone())
                .ok_or_else(|| PaymentError::NotFound(transaction_id.to_string()))
        })
    }

    fn capture_payment<'a>(
        &'a self,
        transaction_id: &'a str,
    ) -> PaymentFuture<'a, PaymentStatus> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut ledger = self.ledger();
            let transaction = ledger
                .get_mut(transaction_id)
                .ok_or_else(|| PaymentError::NotFound(transaction_id.to_string()))?;

            match transaction.status.status {
                PaymentState::Captured => return Ok(transaction.status.clone()),
                PaymentState::Authorized => {}
                other => {
                    return Err(PaymentError::InvalidState {
                        transaction_id: transaction_id.to_string(),
                        status: other.as_str().to_string(),
                    });
                }
            }

            if take_one(&self.capture_failures) {
                transaction.status.status = PaymentState::Failed;
                transaction.status.failure_reason = Some("capture refused".to_string());
                transaction.status.processed_at = now;
                return Err(PaymentError::Declined("capture refused".to_string()));
            }

            let bank_ref: u64 = rand::thread_rng().gen_range(1_000_000_000..10_000_000_000);
            transaction.status.status = PaymentState::Captured;
            transaction.status.bank_tran_id = Some(format!("BNK{bank_ref}"));
            transaction.status.processed_at = now;
            Ok(transaction.status.clone())
        })
    }

    fn refund_payment<'a>(
        &'a self,
        transaction_id: &'a str,
        amount_paisa: i64,
        reason: &'a str,
    ) -> PaymentFuture<'a, RefundResponse> {
        Box::pin(async move {
            if take_one(&self.refund_failures) {
                return Err(PaymentError::Gateway("refund endpoint unreachable".to_string()));
            }

            let now = self.clock.now();
            let mut ledger = self.ledger();
            let transaction = ledger
                .get_mut(transaction_id)
                .ok_or_else(|| PaymentError::NotFound(transaction_id.to_string()))?;
            if transaction.status.status != PaymentState::Captured {
                return Err(PaymentError::InvalidState {
                    transaction_id: transaction_id.to_string(),
                    status: transaction.status.status.as_str().to_string(),
                });
            }
            if amount_paisa <= 0 || amount_paisa > transaction.status.amount_paisa {
                return Err(PaymentError::Declined(format!(
                    "refund amount {amount_paisa} outside 1..={}",
                    transaction.status.amount_paisa
                )));
            }

            transaction.status.status = PaymentState::Refunded;
            transaction.status.processed_at = now;
            Ok(RefundResponse {
                refund_id: format!("RF-{}", Uuid::new_v4().simple()),
                transaction_id: transaction_id.to_string(),
                amount_paisa,
                status: "refunded".to_string(),
                reason: reason.to_string(),
                processed_at: now,
            })
        })
    }

    fn validate_ipn<'a>(&'a self, payload: &'a [u8]) -> PaymentFuture<'a, IpnData> {
        Box::pin(async move {
            let ipn: IpnPayload = serde_json::from_slice(payload)
                .map_err(|e| PaymentError::IpnInvalid(e.to_string()))?;
            let ledger = self.ledger();
            let transaction = ledger
                .get(&ipn.transaction_id)
                .ok_or_else(|| PaymentError::IpnInvalid("unknown transaction".to_string()))?;

            Ok(IpnData {
                is_valid: transaction.status.amount_paisa == ipn.amount_paisa,
                order_id: transaction.order_id.clone(),
                gateway_ref: transaction.status.gateway_ref.clone(),
                transaction_id: ipn.transaction_id,
                status: ipn.status,
                amount_paisa: ipn.amount_paisa,
            })
        })
    }

    fn health_check(&self) -> PaymentFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use seatline_testing::test_clock;

    fn provider() -> SandboxProvider {
        SandboxProvider::new("sslcommerz", Arc::new(test_clock()))
    }

    fn request(amount: i64) -> CreatePaymentRequest {
        CreatePaymentRequest {
            order_id: "order-1".into(),
            amount_paisa: amount,
            currency: "BDT".into(),
            ..CreatePaymentRequest::default()
        }
    }

    #[tokio::test]
    async fn test_capture_and_refund() {
        let p = provider();
        let created = p.create_payment(&request(84_000)).await.unwrap();
        assert!(created.transaction_id.starts_with("SSL-"));

        let captured = p.capture_payment(&created.transaction_id).await.unwrap();
        assert_eq!(captured.status, PaymentState::Captured);
        assert!(captured.bank_tran_id.is_some());
        // Second capture is a no-op.
        p.capture_payment(&created.transaction_id).await.unwrap();

        let refund = p
            .refund_payment(&created.transaction_id, 84_000, "cancelled")
            .await
            .unwrap();
        assert_eq!(refund.amount_paisa, 84_000);
        assert_eq!(p.state(&created.transaction_id), Some(PaymentState::Refunded));
    }

    #[tokio::test]
    async fn test_injected_capture_failure() {
        let p = provider();
        p.fail_next_captures(1);
        let created = p.create_payment(&request(100)).await.unwrap();
        assert!(matches!(
            p.capture_payment(&created.transaction_id).await,
            Err(PaymentError::Declined(_))
        ));
        assert_eq!(p.state(&created.transaction_id), Some(PaymentState::Failed));
    }

    #[tokio::test]
    async fn test_refund_requires_capture() {
        let p = provider();
        let created = p.create_payment(&request(100)).await.unwrap();
        assert!(matches!(
            p.refund_payment(&created.transaction_id, 100, "x").await,
            Err(PaymentError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_ipn_checks_amount() {
        let p = provider();
        let created = p.create_payment(&request(500)).await.unwrap();
        let body = serde_json::json!({
            "transaction_id": created.transaction_id,
            "status": "captured",
            "amount_paisa": 400,
        });
        let ipn = p.validate_ipn(body.to_string().as_bytes()).await.unwrap();
        assert!(!ipn.is_valid);
        assert_eq!(ipn.order_id, "order-1");

        assert!(matches!(
            p.validate_ipn(b"not json").await,
            Err(PaymentError::IpnInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_declines() {
        let p = provider();
        p.decline_next(1);
        assert!(p.create_payment(&request(100)).await.is_err());
        assert!(p.create_payment(&request(100)).await.is_ok());
        assert!(p.create_payment(&request(0)).await.is_err());
    }
}
