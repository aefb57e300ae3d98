//! Router configuration.

use super::health::{metrics, readiness_check};
use super::state::AppState;
use crate::api::{admin, idempotency, inventory, orders, realtime};
use axum::{
    Extension, Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use seatline_web::extractors::DefaultRequestTimeout;
use seatline_web::handlers::health_check;
use seatline_web::request_id_layer;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Build the complete router.
///
/// `request_timeout` is the budget of requests without an
/// `X-Request-Timeout-Ms` header.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let idempotent = from_fn_with_state(state.cache.clone(), idempotency);

    let v1 = Router::new()
        // Inventory
        .route("/inventory/trips", post(inventory::initialize_trip))
        .route(
            "/inventory/trips/:trip_id/availability",
            get(inventory::check_availability),
        )
        .route(
            "/inventory/trips/:trip_id/seatmap",
            get(inventory::get_seat_map),
        )
        .route(
            "/inventory/trips/:trip_id/seats/:seat_id/block",
            post(inventory::set_seat_blocked),
        )
        .route("/inventory/holds", post(inventory::hold_seats))
        .route("/inventory/holds/:hold_id", delete(inventory::release_hold))
        .route(
            "/inventory/holds/:hold_id/confirm",
            post(inventory::confirm_hold),
        )
        .route(
            "/inventory/bookings/:booking_id/cancel",
            post(inventory::cancel_booking),
        )
        // Orders
        .route(
            "/orders",
            post(orders::create_order)
                .layer(idempotent)
                .get(orders::list_orders),
        )
        .route("/orders/:order_id", get(orders::get_order))
        .route("/orders/:order_id/cancel", post(orders::cancel_order))
        // Operators
        .route("/sagas/:saga_id/retry", post(admin::retry_saga))
        .route(
            "/entitlements/:org_id/invalidate",
            post(admin::invalidate_entitlement),
        )
        // Live updates
        .route("/realtime/trips/:trip_id", get(realtime::subscribe_trip));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .nest("/v1", v1)
        .layer(Extension(DefaultRequestTimeout(request_timeout)))
        .layer(request_id_layer())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
