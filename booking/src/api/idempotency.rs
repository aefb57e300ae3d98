//! Replay protection for mutating endpoints.
//!
//! A request carrying `Idempotency-Key` claims `idempotency:{key}` in the
//! shared cache before the handler runs:
//!
//! - key absent: claim it as `PROCESSING` for [`PROCESSING_TTL`], run the
//!   handler, then store a 2xx response for [`RESPONSE_TTL`] or drop the claim
//!   so the client can retry
//! - key `PROCESSING`: 409, another attempt is in flight
//! - key holds a response: replay it with `X-Idempotency-Hit: true`
//!
//! An unreachable cache lets the request through; the order store still
//! deduplicates on the key.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use seatline_core::cache::SharedCache;
use seatline_web::AppError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Request header carrying the client's key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
/// Response header set on replays.
pub const IDEMPOTENCY_HIT_HEADER: &str = "X-Idempotency-Hit";
/// Marker stored while the first attempt runs.
pub const PROCESSING: &str = "PROCESSING";
/// Lifetime of the in-flight marker.
pub const PROCESSING_TTL: Duration = Duration::from_secs(60);
/// Lifetime of a stored response.
pub const RESPONSE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_STORED_BODY: usize = 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    body: String,
}

fn cache_key(key: &str) -> String {
    format!("idempotency:{key}")
}

/// The client's key, if the request carries a usable one.
#[must_use]
pub fn idempotency_key(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Middleware function; install with `axum::middleware::from_fn_with_state`.
pub async fn idempotency(
    State(cache): State<Arc<dyn SharedCache>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = idempotency_key(request.headers()) else {
        return next.run(request).await;
    };
    let cache_key = cache_key(&key);

    match cache.get(&cache_key).await {
        Ok(Some(value)) if value == PROCESSING => {
            return AppError::conflict("request is currently being processed").into_response();
        }
        Ok(Some(value)) => match serde_json::from_str::<StoredResponse>(&value) {
            Ok(stored) => return replay(stored),
            Err(e) => {
                tracing::warn!(idempotency_key = %key, error = %e, "Unreadable stored response, reprocessing");
            }
        },
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(idempotency_key = %key, error = %e, "Idempotency cache unavailable");
            return next.run(request).await;
        }
    }

    match cache.set_nx(&cache_key, PROCESSING, PROCESSING_TTL).await {
        Ok(true) => {}
        Ok(false) => {
            return AppError::conflict("request is currently being processed").into_response();
        }
        Err(e) => {
            tracing::warn!(idempotency_key = %key, error = %e, "Idempotency claim failed");
            return next.run(request).await;
        }
    }

    let response = next.run(request).await;
    let status = response.status();
    if !status.is_success() {
        release(cache.as_ref(), &cache_key).await;
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_STORED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            release(cache.as_ref(), &cache_key).await;
            return AppError::internal("response could not be buffered")
                .with_source(anyhow::anyhow!(e.to_string()))
                .into_response();
        }
    };

    store(cache.as_ref(), &cache_key, status, &bytes).await;
    Response::from_parts(parts, Body::from(bytes))
}

async fn store(cache: &dyn SharedCache, cache_key: &str, status: StatusCode, body: &Bytes) {
    let stored = StoredResponse {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).into_owned(),
    };
    let value = match serde_json::to_string(&stored) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Response not stored for replay");
            release(cache, cache_key).await;
            return;
        }
    };
    if let Err(e) = cache.set(cache_key, &value, RESPONSE_TTL).await {
        tracing::warn!(error = %e, "Response not stored for replay");
    }
}

async fn release(cache: &dyn SharedCache, cache_key: &str) {
    if let Err(e) = cache.delete_if_equals(cache_key, PROCESSING).await {
        tracing::warn!(error = %e, "Idempotency claim not released");
    }
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, stored.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(IDEMPOTENCY_HIT_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{Router, routing::post};
    use seatline_testing::InMemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app(cache: Arc<InMemoryCache>, calls: Arc<AtomicUsize>, status: StatusCode) -> Router {
        let shared: Arc<dyn SharedCache> = cache;
        Router::new()
            .route(
                "/orders",
                post(move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        (status, format!("{{\"call\":{n}}}"))
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(shared, idempotency))
    }

    fn request(key: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().method("POST").uri("/orders");
        if let Some(key) = key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_success_is_replayed() {
        let cache = Arc::new(InMemoryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), calls.clone(), StatusCode::CREATED);

        let first = app.clone().oneshot(request(Some("k-1"))).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        assert_eq!(body(first).await, "{\"call\":1}");

        let second = app.oneshot(request(Some("k-1"))).await.unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert_eq!(second.headers().get(IDEMPOTENCY_HIT_HEADER).unwrap(), "true");
        assert_eq!(body(second).await, "{\"call\":1}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_duplicate_conflicts() {
        let cache = Arc::new(InMemoryCache::new());
        cache
            .set("idempotency:k-2", PROCESSING, PROCESSING_TTL)
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache, calls.clone(), StatusCode::CREATED);

        let response = app.oneshot(request(Some("k-2"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_releases_key() {
        let cache = Arc::new(InMemoryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), calls.clone(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.clone().oneshot(request(Some("k-3"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(cache.peek("idempotency:k-3").is_none());

        app.oneshot(request(Some("k-3"))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_requests_without_key_pass_through() {
        let cache = Arc::new(InMemoryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), calls.clone(), StatusCode::CREATED);

        app.clone().oneshot(request(None)).await.unwrap();
        app.oneshot(request(None)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.keys().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_cache_lets_request_through() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set_unavailable(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache, calls.clone(), StatusCode::CREATED);

        let response = app.oneshot(request(Some("k-4"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
