//! National identity document checks.
//!
//! Format validation is local; verification against a citizen registry goes
//! through an [`IdentityProvider`] per country.

use chrono::{DateTime, NaiveDate, Utc};
use seatline_core::environment::Clock;
use seatline_core::error::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Malformed document number.
pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
/// Unknown to the registry.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Date of birth does not match the registry.
pub const DOB_MISMATCH: &str = "DOB_MISMATCH";

/// Boxed future returned by [`IdentityProvider`] operations.
pub type IdentityFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IdentityError>> + Send + 'a>>;

/// Identity errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Not 10 or 17 digits.
    #[error("invalid NID format: {0}")]
    InvalidFormat(String),

    /// The registry rejected the document.
    #[error("identity rejected ({code}): {message}")]
    Rejected {
        /// Provider error code.
        code: String,
        /// Detail.
        message: String,
    },

    /// The provider could not be reached.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl Classify for IdentityError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) => ErrorKind::Precondition,
            Self::Rejected { .. } => ErrorKind::Permanent,
            Self::Unavailable(_) => ErrorKind::Transient,
        }
    }
}

/// Strip spaces and dashes.
#[must_use]
pub fn normalize_nid(nid: &str) -> String {
    nid.chars().filter(char::is_ascii_digit).collect()
}

/// A national id is 10 (old card) or 17 (smart card) ASCII digits.
///
/// # Errors
///
/// [`IdentityError::InvalidFormat`] otherwise.
pub fn validate_nid_format(nid: &str) -> Result<(), IdentityError> {
    let digits = nid.bytes().all(|b| b.is_ascii_digit());
    if digits && matches!(nid.len(), 10 | 17) {
        Ok(())
    } else {
        Err(IdentityError::InvalidFormat(nid.to_string()))
    }
}

/// Verification input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Document number.
    pub nid: String,
    /// Holder's name, for matching.
    pub name: String,
    /// Holder's date of birth.
    pub date_of_birth: Option<NaiveDate>,
}

/// Verification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// The registry confirmed the document.
    pub is_valid: bool,
    /// 0.0 to 1.0.
    pub confidence: f64,
    /// Provider that answered.
    pub provider_name: String,
    /// When.
    pub verified_at: DateTime<Utc>,
    /// Why not, when invalid.
    pub error_code: Option<String>,
    /// Detail, when invalid.
    pub error_message: Option<String>,
}

impl VerifyResponse {
    fn rejected(provider: &str, at: DateTime<Utc>, code: &str, message: &str) -> Self {
        Self {
            is_valid: false,
            confidence: 0.0,
            provider_name: provider.to_string(),
            verified_at: at,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
        }
    }

    /// Turn an invalid response into an error.
    ///
    /// # Errors
    ///
    /// [`IdentityError::Rejected`] when `is_valid` is false.
    pub fn into_result(self) -> Result<Self, IdentityError> {
        if self.is_valid {
            return Ok(self);
        }
        Err(IdentityError::Rejected {
            code: self.error_code.unwrap_or_else(|| "VERIFICATION_FAILED".to_string()),
            message: self.error_message.unwrap_or_default(),
        })
    }
}

/// A citizen registry.
pub trait IdentityProvider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// ISO country code served.
    fn country(&self) -> &str;

    /// Check a document.
    fn verify<'a>(&'a self, request: &'a VerifyRequest) -> IdentityFuture<'a, VerifyResponse>;

    /// Whether the registry is reachable.
    fn health_check(&self) -> IdentityFuture<'_, ()>;
}

/// Registry stand-in with fixed rules: numbers starting with `0` are unknown,
/// numbers starting with `9` never match a supplied date of birth, everything
/// else well-formed is valid.
pub struct SandboxIdentityProvider {
    clock: Arc<dyn Clock>,
}

impl SandboxIdentityProvider {
    /// A sandbox registry.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl IdentityProvider for SandboxIdentityProvider {
    fn name(&self) -> &str {
        "sandbox"
    }

    fn country(&self) -> &str {
        "BD"
    }

    fn verify<'a>(&'a self, request: &'a VerifyRequest) -> IdentityFuture<'a, VerifyResponse> {
        Box::pin(async move {
            let now = self.clock.now();
            let nid = normalize_nid(&request.nid);
            if validate_nid_format(&nid).is_err() {
                return Ok(VerifyResponse::rejected(
                    self.name(),
                    now,
                    INVALID_FORMAT,
                    "NID must be 10 or 17 digits",
                ));
            }
            if nid.starts_with('0') {
                return Ok(VerifyResponse::rejected(
                    self.name(),
                    now,
                    NOT_FOUND,
                    "NID not found in registry",
                ));
            }
            if nid.starts_with('9') && request.date_of_birth.is_some() {
                return Ok(VerifyResponse::rejected(
                    self.name(),
                    now,
                    DOB_MISMATCH,
                    "date of birth does not match",
                ));
            }

            Ok(VerifyResponse {
                is_valid: true,
                confidence: 0.95,
                provider_name: self.name().to_string(),
                verified_at: now,
                error_code: None,
                error_message: None,
            })
        })
    }

    fn health_check(&self) -> IdentityFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use seatline_testing::test_clock;

    fn request(nid: &str, dob: Option<NaiveDate>) -> VerifyRequest {
        VerifyRequest {
            nid: nid.to_string(),
            name: "Rahim Uddin".to_string(),
            date_of_birth: dob,
        }
    }

    #[test]
    fn test_format() {
        assert!(validate_nid_format("1234567890").is_ok());
        assert!(validate_nid_format("12345678901234567").is_ok());
        assert!(validate_nid_format("123456789").is_err());
        assert!(validate_nid_format("12345678a0").is_err());
        assert!(validate_nid_format("١٢٣٤٥٦٧٨٩٠").is_err());
        assert_eq!(normalize_nid("123-456 7890"), "1234567890");
    }

    #[tokio::test]
    async fn test_sandbox_rules() {
        let provider = SandboxIdentityProvider::new(Arc::new(test_clock()));
        let dob = NaiveDate::from_ymd_opt(1990, 1, 1);

        assert!(provider.verify(&request("1234567890", dob)).await.unwrap().is_valid);

        let unknown = provider.verify(&request("0234567890", None)).await.unwrap();
        assert_eq!(unknown.error_code.as_deref(), Some(NOT_FOUND));

        let mismatch = provider.verify(&request("9234567890", dob)).await.unwrap();
        assert_eq!(mismatch.error_code.as_deref(), Some(DOB_MISMATCH));
        assert!(provider.verify(&request("9234567890", None)).await.unwrap().is_valid);

        let malformed = provider.verify(&request("12", None)).await.unwrap();
        assert!(matches!(
            malformed.into_result(),
            Err(IdentityError::Rejected { code, .. }) if code == INVALID_FORMAT
        ));
    }
}
