//! Caller identity taken from gateway headers.
//!
//! Authentication happens upstream; the gateway forwards the tenant and user
//! as plain headers.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use seatline_web::AppError;

/// Header naming the tenant.
pub const ORGANIZATION_HEADER: &str = "X-Organization-Id";
/// Header naming the end user.
pub const USER_HEADER: &str = "X-User-Id";

/// Tenant of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization(pub String);

/// Tenant and user of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Tenant.
    pub organization_id: String,
    /// User.
    pub user_id: String,
}

fn header(parts: &Parts, name: &str) -> Result<String, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized(format!("missing {name} header")))
}

#[async_trait]
impl<S> FromRequestParts<S> for Organization
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header(parts, ORGANIZATION_HEADER).map(Self)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self {
            organization_id: header(parts, ORGANIZATION_HEADER)?,
            user_id: header(parts, USER_HEADER)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    fn parts_with(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_caller_from_headers() {
        let mut parts = parts_with(&[(ORGANIZATION_HEADER, "org-1"), (USER_HEADER, " u-1 ")]);
        let caller = Caller::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(caller.organization_id, "org-1");
        assert_eq!(caller.user_id, "u-1");
    }

    #[tokio::test]
    async fn test_missing_user_is_rejected() {
        let mut parts = parts_with(&[(ORGANIZATION_HEADER, "org-1")]);
        let err = Caller::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_blank_organization_is_rejected() {
        let mut parts = parts_with(&[(ORGANIZATION_HEADER, "  ")]);
        assert!(Organization::from_request_parts(&mut parts, &()).await.is_err());
    }
}
