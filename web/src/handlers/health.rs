//! Health check endpoints.
//!
//! `GET /health` answers as long as the process is serving. `GET /ready` asks
//! every registered [`ReadinessProbe`] and answers 503 if any of them fails.

use axum::{Json, http::StatusCode};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Liveness: returns 200 without touching dependencies.
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// A dependency consulted by the readiness endpoint.
pub trait ReadinessProbe: Send + Sync {
    /// Short name shown in the report, e.g. `postgres`.
    fn name(&self) -> &'static str;

    /// Resolve to `Err(reason)` when the dependency cannot serve.
    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// One probe's outcome.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeResult {
    /// Probe name.
    pub name: &'static str,
    /// `true` if the probe passed.
    pub ok: bool,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness report body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    /// `ready` or `not_ready`.
    pub status: &'static str,
    /// Per-probe results, in registration order.
    pub checks: Vec<ProbeResult>,
}

/// Run every probe and build the `/ready` response.
///
/// # Response
///
/// ```json
/// {
///   "status": "not_ready",
///   "checks": [
///     { "name": "postgres", "ok": true },
///     { "name": "redis", "ok": false, "error": "connection refused" }
///   ]
/// }
/// ```
pub async fn readiness(probes: &[Arc<dyn ReadinessProbe>]) -> (StatusCode, Json<ReadinessReport>) {
    let results = futures::future::join_all(probes.iter().map(|probe| async move {
        match probe.probe().await {
            Ok(()) => ProbeResult {
                name: probe.name(),
                ok: true,
                error: None,
            },
            Err(error) => {
                tracing::warn!(probe = probe.name(), error = %error, "Readiness probe failed");
                ProbeResult {
                    name: probe.name(),
                    ok: false,
                    error: Some(error),
                }
            }
        }
    }))
    .await;

    let ready = results.iter().all(|r| r.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessReport {
            status: if ready { "ready" } else { "not_ready" },
            checks: results,
        }),
    )
}
