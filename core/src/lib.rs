//! # Seatline Core
//!
//! Domain types and the trait seams of the Seatline booking platform.
//!
//! This crate owns the contracts every other crate meets: the seat-segment
//! inventory model, the transactional outbox, persistent saga records, orders,
//! the event envelope, and the dyn-compatible traits behind which the
//! authoritative store, the shared cache and the durable log are hidden.
//!
//! ## Core Concepts
//!
//! - **Seat-segment row**: `(trip, segment, seat) → state`, the unit of inventory
//! - **Hold**: a time-bounded, all-or-nothing reservation across a journey's rows
//! - **Outbox entry**: an event written in the same transaction as the change it describes
//! - **Saga record**: the persisted progress of a multi-step transaction
//! - **Error kind**: how a failure travels (retried, compensated, surfaced)
//!
//! ## Crate Map
//!
//! | Trait | Implementations |
//! |-------|-----------------|
//! | [`inventory::InventoryStore`] | `seatline-postgres`, `seatline-testing` |
//! | [`outbox::OutboxStore`] | `seatline-postgres`, `seatline-testing` |
//! | [`saga::SagaStore`] | `seatline-postgres`, `seatline-testing` |
//! | [`order::OrderRepository`] | `seatline-postgres`, `seatline-testing` |
//! | [`cache::SharedCache`] | `seatline-redis`, `seatline-testing` |
//! | [`event_bus::EventBus`] | `seatline-redpanda`, `seatline-testing` |

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod cache;
pub mod dead_letter;
pub mod deadline;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod inventory;
pub mod order;
pub mod outbox;
pub mod saga;

/// Environment module - injected dependencies that are not storage.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Every expiry decision (hold liveness, outbox retention, cache TTL) reads
    /// time through a `Clock` so tests can move it explicitly.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
