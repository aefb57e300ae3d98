//! Payment providers.
//!
//! A provider is anything that can create, verify, capture and refund a
//! payment and validate its notifications. Providers are built by factories
//! registered by name in a [`PaymentRegistry`], which also maps payment
//! methods (`card`, `bkash`, ...) onto provider names.

mod registry;
mod sandbox;

pub use registry::PaymentRegistry;
pub use sandbox::{SandboxFactory, SandboxProvider};

use chrono::{DateTime, Utc};
use seatline_core::error::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by [`PaymentProvider`] operations.
pub type PaymentFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PaymentError>> + Send + 'a>>;

/// Provider-side payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    /// Created, awaiting the customer.
    Pending,
    /// Customer finished, provider deciding.
    Processing,
    /// Funds reserved.
    Authorized,
    /// Funds taken.
    Captured,
    /// Refused or errored.
    Failed,
    /// Abandoned.
    Cancelled,
    /// Returned to the customer.
    Refunded,
}

impl PaymentState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

/// Payment initiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    /// Order being paid.
    pub order_id: String,
    /// Amount in paisa.
    pub amount_paisa: i64,
    /// ISO currency.
    pub currency: String,
    /// Customer name.
    pub customer_name: String,
    /// Customer email.
    pub customer_email: String,
    /// Customer phone.
    pub customer_phone: String,
    /// Statement description.
    pub description: String,
    /// Where the provider sends the customer afterwards.
    pub return_url: String,
    /// Where the provider sends the customer on cancel.
    pub cancel_url: String,
    /// Where the provider posts notifications.
    pub ipn_url: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A created payment session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePaymentResponse {
    /// Provider transaction id.
    pub transaction_id: String,
    /// Provider session id.
    pub session_id: String,
    /// Checkout URL for the customer.
    pub redirect_url: String,
    /// Provider reference.
    pub gateway_ref: String,
    /// When the session lapses.
    pub expires_at: DateTime<Utc>,
    /// State after creation.
    pub status: PaymentState,
}

/// Current state of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatus {
    /// Provider transaction id.
    pub transaction_id: String,
    /// Provider reference.
    pub gateway_ref: String,
    /// State.
    pub status: PaymentState,
    /// Amount in paisa.
    pub amount_paisa: i64,
    /// ISO currency.
    pub currency: String,
    /// Bank transaction reference, once settled.
    pub bank_tran_id: Option<String>,
    /// Why the payment failed.
    pub failure_reason: Option<String>,
    /// Last state change.
    pub processed_at: DateTime<Utc>,
}

/// Result of a refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResponse {
    /// Refund id.
    pub refund_id: String,
    /// Refunded transaction.
    pub transaction_id: String,
    /// Amount returned, in paisa.
    pub amount_paisa: i64,
    /// Provider refund status.
    pub status: String,
    /// Stated reason.
    pub reason: String,
    /// When the refund was accepted.
    pub processed_at: DateTime<Utc>,
}

/// A parsed instant payment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpnData {
    /// Provider transaction id.
    pub transaction_id: String,
    /// Order the payment belongs to.
    pub order_id: String,
    /// Reported state.
    pub status: PaymentState,
    /// Reported amount in paisa.
    pub amount_paisa: i64,
    /// Provider reference.
    pub gateway_ref: String,
    /// Whether the notification checked out against the provider's record.
    pub is_valid: bool,
}

/// Payment errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// No factory or provider registered under this name.
    #[error("payment gateway {0} not found")]
    GatewayNotFound(String),

    /// Credentials could not be used to build a provider.
    #[error("invalid credentials for {provider}: {reason}")]
    InvalidCredentials {
        /// Provider.
        provider: String,
        /// What was wrong.
        reason: String,
    },

    /// The provider has no such transaction.
    #[error("payment {0} not found")]
    NotFound(String),

    /// The provider refused the payment.
    #[error("payment declined: {0}")]
    Declined(String),

    /// The operation does not apply in the transaction's state.
    #[error("payment {transaction_id} is {status}")]
    InvalidState {
        /// Transaction.
        transaction_id: String,
        /// Its state.
        status: String,
    },

    /// A notification did not validate.
    #[error("IPN validation failed: {0}")]
    IpnInvalid(String),

    /// A callback payload lacked the order reference.
    #[error("{0} not found in payload")]
    MissingField(&'static str),

    /// The provider could not be reached or errored.
    #[error("payment gateway error: {0}")]
    Gateway(String),
}

impl Classify for PaymentError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::MissingField(_) => ErrorKind::Precondition,
            Self::Gateway(_) => ErrorKind::Transient,
            Self::GatewayNotFound(_)
            | Self::InvalidCredentials { .. }
            | Self::Declined(_)
            | Self::IpnInvalid(_) => ErrorKind::Permanent,
        }
    }
}

/// One payment provider.
pub trait PaymentProvider: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Start a payment.
    fn create_payment<'a>(
        &'a self,
        request: &'a CreatePaymentRequest,
    ) -> PaymentFuture<'a, CreatePaymentResponse>;

    /// Current state of a payment.
    fn verify_payment<'a>(&'a self, transaction_id: &'a str) -> PaymentFuture<'a, PaymentStatus>;

    /// Take authorised funds. Capturing a captured payment is a no-op.
    fn capture_payment<'a>(&'a self, transaction_id: &'a str)
    -> PaymentFuture<'a, PaymentStatus>;

    /// Return captured funds.
    fn refund_payment<'a>(
        &'a self,
        transaction_id: &'a str,
        amount_paisa: i64,
        reason: &'a str,
    ) -> PaymentFuture<'a, RefundResponse>;

    /// Parse and check a notification body.
    fn validate_ipn<'a>(&'a self, payload: &'a [u8]) -> PaymentFuture<'a, IpnData>;

    /// Whether the provider is reachable.
    fn health_check(&self) -> PaymentFuture<'_, ()>;
}

/// Builds providers of one kind.
pub trait ProviderFactory: Send + Sync {
    /// Build a provider from stored credentials.
    ///
    /// # Errors
    ///
    /// [`PaymentError::InvalidCredentials`] if the credentials are unusable.
    fn create(
        &self,
        credentials: &serde_json::Value,
        sandbox: bool,
    ) -> Result<Arc<dyn PaymentProvider>, PaymentError>;

    /// Extract the order id from a provider callback.
    ///
    /// # Errors
    ///
    /// [`PaymentError::MissingField`] if the payload lacks it.
    fn parse_order_id(&self, payload: &HashMap<String, String>) -> Result<String, PaymentError>;
}
