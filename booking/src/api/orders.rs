//! Order endpoints.
//!
//! `POST /v1/orders` runs behind the idempotency middleware; the same key is
//! also stored on the order so a retry that misses the cache still finds it.

use super::Caller;
use super::idempotency::idempotency_key;
use crate::orders::{CancelOrderRequest, CreateOrderRequest, OrderError, OrderPage};
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use seatline_core::order::Order;
use seatline_web::{AppError, ClientIp, RequestDeadline, WebResult};
use serde::Deserialize;
use uuid::Uuid;

/// Edge mapping of order errors; quota exhaustion is 429, malformed orders 422.
pub(crate) fn order_error(err: &OrderError) -> AppError {
    match err {
        OrderError::Entitlement(e) if e.is_quota() => AppError::quota_exhausted(e.to_string()),
        OrderError::Validation(message) => AppError::validation(message.clone()),
        other => AppError::classified(other),
    }
}

/// Place an order; the booking saga continues in the background.
pub async fn create_order(
    State(state): State<AppState>,
    caller: Caller,
    ClientIp(client_ip): ClientIp,
    RequestDeadline(deadline): RequestDeadline,
    headers: HeaderMap,
    Json(mut request): Json<CreateOrderRequest>,
) -> WebResult<(StatusCode, Json<Order>)> {
    request.organization_id = caller.organization_id;
    request.user_id = caller.user_id;
    request.client_ip = Some(client_ip.to_string());
    if request.idempotency_key.is_none() {
        request.idempotency_key = idempotency_key(&headers);
    }

    let order = state
        .orders
        .create_order(request, deadline)
        .await
        .map_err(|e| order_error(&e))?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Paging parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ListOrdersParams {
    /// Page size, capped server-side.
    pub page_size: Option<usize>,
    /// Token from the previous page.
    pub page_token: Option<String>,
}

/// The caller's orders, newest first.
pub async fn list_orders(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ListOrdersParams>,
) -> WebResult<Json<OrderPage>> {
    state
        .orders
        .list_orders(
            &caller.organization_id,
            &caller.user_id,
            params.page_size,
            params.page_token.as_deref(),
        )
        .await
        .map(Json)
        .map_err(|e| order_error(&e))
}

/// One order of the caller.
pub async fn get_order(
    State(state): State<AppState>,
    caller: Caller,
    Path(order_id): Path<Uuid>,
) -> WebResult<Json<Order>> {
    let order = state
        .orders
        .get_order(&caller.organization_id, order_id)
        .await
        .map_err(|e| order_error(&e))?;
    if order.user_id != caller.user_id {
        return Err(AppError::not_found("Order", order_id));
    }
    Ok(Json(order))
}

/// Body of the cancel endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct CancelOrderBody {
    /// Why the buyer cancels.
    #[serde(default)]
    pub reason: String,
}

/// Cancel a confirmed order and refund it.
pub async fn cancel_order(
    State(state): State<AppState>,
    caller: Caller,
    RequestDeadline(deadline): RequestDeadline,
    Path(order_id): Path<Uuid>,
    body: Option<Json<CancelOrderBody>>,
) -> WebResult<Json<Order>> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    let request = CancelOrderRequest {
        organization_id: caller.organization_id,
        user_id: caller.user_id,
        order_id,
        reason: if reason.is_empty() {
            "cancelled by customer".to_string()
        } else {
            reason
        },
    };
    state
        .orders
        .cancel_order(request, deadline)
        .await
        .map(Json)
        .map_err(|e| order_error(&e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entitlement::EntitlementError;
    use crate::inventory::InventoryError;

    #[test]
    fn test_quota_is_too_many_requests() {
        let err = OrderError::Entitlement(EntitlementError::QuotaExceeded {
            resource: "max_bookings_per_month".into(),
            used: 10,
            limit: 10,
        });
        assert_eq!(order_error(&err).status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_inactive_subscription_is_payment_required() {
        let err = OrderError::Entitlement(EntitlementError::Inactive("past_due".into()));
        assert_eq!(order_error(&err).status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_validation_is_unprocessable() {
        let err = OrderError::Validation("no passengers".into());
        assert_eq!(order_error(&err).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_seat_conflict_is_conflict() {
        let err = OrderError::Inventory(InventoryError::Contention);
        assert_eq!(order_error(&err).status(), StatusCode::CONFLICT);
    }
}
