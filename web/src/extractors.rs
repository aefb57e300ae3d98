//! Custom Axum extractors.
//!
//! - [`RequestId`]: the id assigned by [`crate::middleware::request_id_layer`]
//! - [`ClientIp`]: first `X-Forwarded-For` hop, `X-Real-IP`, or the peer address
//! - [`RequestDeadline`]: a [`Deadline`] from `X-Request-Timeout-Ms`
//!
//! # Examples
//!
//! ```ignore
//! async fn hold_seats(
//!     State(state): State<AppState>,
//!     client_ip: ClientIp,
//!     RequestDeadline(deadline): RequestDeadline,
//!     Json(body): Json<HoldRequest>,
//! ) -> Result<Json<HoldResponse>, AppError> {
//!     tracing::info!(client_ip = %client_ip.0, "Hold requested");
//!     ...
//! }
//! ```

use crate::middleware::REQUEST_ID_HEADER;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use seatline_core::deadline::Deadline;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;

/// Header carrying the caller's time budget in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "X-Request-Timeout-Ms";

/// Budget used when neither the header nor a [`DefaultRequestTimeout`] extension is present.
pub const FALLBACK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Request id for log correlation.
///
/// Reads the id stored by the middleware, then the `X-Request-Id` header, and
/// generates a fresh one otherwise.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .extensions
            .get::<Uuid>()
            .copied()
            .or_else(|| {
                parts
                    .headers
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
            .unwrap_or_else(Uuid::new_v4);

        Ok(Self(id))
    }
}

/// Client IP address.
///
/// # Priority
///
/// 1. `X-Forwarded-For` (first IP in the list)
/// 2. `X-Real-IP`
/// 3. Peer address from `ConnectInfo`
/// 4. `127.0.0.1`
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(Self(extract_client_ip(&parts.headers, peer)))
    }
}

fn extract_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> IpAddr {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());

    let real_ip = || {
        headers
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
    };

    forwarded
        .or_else(real_ip)
        .or(peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Server-wide default request budget, installed as an `Extension`.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRequestTimeout(pub Duration);

/// The request's deadline, propagated to every downstream call.
#[derive(Debug, Clone, Copy)]
pub struct RequestDeadline(pub Deadline);

#[async_trait]
impl<S> FromRequestParts<S> for RequestDeadline
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let default = parts
            .extensions
            .get::<DefaultRequestTimeout>()
            .map_or(FALLBACK_REQUEST_TIMEOUT, |d| d.0);

        let timeout = parts
            .headers
            .get(REQUEST_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map_or(default, Duration::from_millis);

        Ok(Self(Deadline::after(timeout)))
    }
}
