//! HTTP API handlers, grouped by resource.
//!
//! Handlers parse the request, call one service operation with the request's
//! deadline, and map the result; errors go through their `Classify` kind.

pub mod admin;
pub mod caller;
pub mod idempotency;
pub mod inventory;
pub mod orders;
pub mod realtime;

pub use caller::{Caller, ORGANIZATION_HEADER, Organization, USER_HEADER};
pub use idempotency::{IDEMPOTENCY_HEADER, IDEMPOTENCY_HIT_HEADER, idempotency};
