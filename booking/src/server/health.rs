//! Readiness probes and the metrics scrape.

use super::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use seatline_redis::RedisCache;
use seatline_web::handlers::{ReadinessProbe, readiness};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// `GET /ready`.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    readiness(&state.probes).await
}

/// `GET /metrics` in Prometheus text format.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Some(body) => (StatusCode::OK, body),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// `SELECT 1` against the pool.
pub struct PostgresProbe(pub PgPool);

impl ReadinessProbe for PostgresProbe {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.0)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }
}

/// `PING` against the shared cache.
pub struct RedisProbe(pub Arc<RedisCache>);

impl ReadinessProbe for RedisProbe {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move { self.0.ping().await.map_err(|e| e.to_string()) })
    }
}
