//! Operator endpoints.

use super::orders::order_error;
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use seatline_core::saga::SagaRecord;
use seatline_web::{RequestDeadline, WebResult};
use uuid::Uuid;

/// Retry a FAILED or COMPENSATED saga and reconcile its order.
pub async fn retry_saga(
    State(state): State<AppState>,
    RequestDeadline(deadline): RequestDeadline,
    Path(saga_id): Path<Uuid>,
) -> WebResult<Json<SagaRecord>> {
    tracing::info!(%saga_id, "Operator saga retry");
    state
        .orders
        .retry_saga(saga_id, deadline)
        .await
        .map(Json)
        .map_err(|e| order_error(&e))
}

/// Drop an organisation's cached entitlement on every node.
pub async fn invalidate_entitlement(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
) -> StatusCode {
    state.entitlements.invalidate_cache(&org_id).await;
    StatusCode::NO_CONTENT
}
