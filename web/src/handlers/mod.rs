//! Shared HTTP handlers.

pub mod health;
pub mod sse;

pub use health::{ReadinessProbe, health_check, readiness};
pub use sse::{HEARTBEAT_INTERVAL, sse_response};
