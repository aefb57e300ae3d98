//! `GET /v1/realtime/trips/:trip_id`: live seat updates over SSE.

use crate::server::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use seatline_web::handlers::sse_response;

/// Stream this node's updates for a trip until the client disconnects.
pub async fn subscribe_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> impl IntoResponse {
    let subscription = state.fanout.subscribe(&trip_id);
    tracing::debug!(trip_id = %subscription.trip_id(), "Live stream opened");
    sse_response(subscription)
}
