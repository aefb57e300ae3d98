//! Axum integration for Seatline.
//!
//! The booking service's HTTP edge is thin: handlers parse the request, call a
//! service, and map the result. This crate holds the pieces every handler shares:
//!
//! - [`AppError`]: turns a classified component error into a status and a
//!   `{code, message}` JSON body
//! - [`extractors`]: client IP, request id and per-request deadline
//! - [`middleware::request_id_layer`]: request id propagation and a tracing span
//!   per request
//! - [`handlers::health`]: liveness and readiness probes
//! - [`handlers::sse`]: server-sent event streams with a heartbeat comment
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get};
//! use seatline_web::{handlers, middleware::request_id_layer};
//!
//! let app = Router::new()
//!     .route("/health", get(handlers::health::health_check))
//!     .layer(request_id_layer());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;

pub use error::AppError;
pub use extractors::{ClientIp, RequestDeadline, RequestId};
pub use middleware::{REQUEST_ID_HEADER, request_id_layer};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
