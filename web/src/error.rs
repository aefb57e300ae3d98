//! Error types for web handlers.
//!
//! Component errors implement [`Classify`]; [`AppError::classified`] turns the
//! kind into a status:
//!
//! | Kind | Status | Code |
//! |------|--------|------|
//! | `Precondition` | 400 | `BAD_REQUEST` |
//! | `NotFound` | 404 | `NOT_FOUND` |
//! | `Conflict` | 409 | `CONFLICT` |
//! | `Entitlement` | 402 | `PAYMENT_REQUIRED` |
//! | `Transient` | 503 | `SERVICE_UNAVAILABLE` |
//! | `Permanent` | 502 | `BAD_GATEWAY` |
//! | `Invariant` | 500 | `INTERNAL_SERVER_ERROR` |
//!
//! Exhausted quotas use [`AppError::quota_exhausted`] (429) instead of the
//! generic entitlement mapping, and malformed bodies use [`AppError::validation`] (422).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use seatline_core::error::{Classify, ErrorKind};
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```ignore
/// async fn handler(State(state): State<AppState>) -> Result<Json<Order>, AppError> {
///     let order = state.orders.get(id).await.map_err(|e| AppError::classified(&e))?;
///     Ok(Json(order))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: String,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Attach the underlying error for logging.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Map an error kind to its edge status.
    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        match kind {
            ErrorKind::Precondition => Self::bad_request(message),
            ErrorKind::NotFound => Self::new(
                StatusCode::NOT_FOUND,
                message.into(),
                "NOT_FOUND".to_string(),
            ),
            ErrorKind::Conflict => Self::conflict(message),
            ErrorKind::Entitlement => Self::payment_required(message),
            ErrorKind::Transient => Self::unavailable(message),
            ErrorKind::Permanent => Self::bad_gateway(message),
            ErrorKind::Invariant => Self::internal(message),
        }
    }

    /// Map any classified component error, using its `Display` as the message.
    #[must_use]
    pub fn classified<E: Classify + fmt::Display>(err: &E) -> Self {
        Self::from_kind(err.kind(), err.to_string())
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message.into(),
            "BAD_REQUEST".to_string(),
        )
    }

    /// 401 Unauthorized.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            message.into(),
            "UNAUTHORIZED".to_string(),
        )
    }

    /// 402 Payment Required: no active subscription or a gated feature.
    #[must_use]
    pub fn payment_required(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYMENT_REQUIRED,
            message.into(),
            "PAYMENT_REQUIRED".to_string(),
        )
    }

    /// 404 Not Found for a resource and id.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// 409 Conflict.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            message.into(),
            "CONFLICT".to_string(),
        )
    }

    /// 422 Unprocessable Entity.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            message.into(),
            "VALIDATION_ERROR".to_string(),
        )
    }

    /// 429 Too Many Requests: the organisation's quota for the period is used up.
    #[must_use]
    pub fn quota_exhausted(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            message.into(),
            "QUOTA_EXHAUSTED".to_string(),
        )
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// 502 Bad Gateway: a downstream provider refused the request.
    #[must_use]
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            message.into(),
            "BAD_GATEWAY".to_string(),
        )
    }

    /// 503 Service Unavailable.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message.into(),
            "SERVICE_UNAVAILABLE".to_string(),
        )
    }

    /// Response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Request failed"
                ),
                None => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Request failed"
                ),
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}
