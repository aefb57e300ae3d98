//! # Seatline Testing
//!
//! Testing utilities for the Seatline booking platform.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`MockClock`])
//! - In-memory fakes of every storage, cache and bus trait in `seatline-core`
//! - Failure switches on the fakes to exercise retry and fall-through paths
//!
//! ## Example
//!
//! ```ignore
//! use seatline_testing::{InMemoryCache, InMemoryInventoryStore, MockClock};
//!
//! #[tokio::test]
//! async fn test_hold_expires() {
//!     let clock = MockClock::at_test_epoch();
//!     let store = Arc::new(InMemoryInventoryStore::new());
//!     let cache = Arc::new(InMemoryCache::with_clock(Arc::new(clock.clone())));
//!     let engine = InventoryEngine::new(store, cache, Arc::new(clock.clone()), config);
//!
//!     let hold = engine.hold_seats(request, Deadline::none()).await?;
//!     clock.advance(chrono::Duration::seconds(2));
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use seatline_core::environment::Clock;

mod cache;
mod event_bus;
mod inventory;
mod stores;

pub use cache::InMemoryCache;
pub use event_bus::InMemoryEventBus;
pub use inventory::InMemoryInventoryStore;
pub use stores::{InMemoryDeadLetters, InMemoryOrders, InMemoryOutbox, InMemorySagaStore};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use seatline_testing::mocks::FixedClock;
    /// use seatline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    #[allow(clippy::expect_used)]
    fn test_epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// A clock tests move by hand.
    ///
    /// Clones share the same instant, so a clone handed to a component can be
    /// advanced from the test body.
    ///
    /// ```
    /// use seatline_testing::MockClock;
    /// use seatline_core::environment::Clock;
    ///
    /// let clock = MockClock::at_test_epoch();
    /// let before = clock.now();
    /// clock.advance(chrono::Duration::seconds(2));
    /// assert_eq!(clock.now() - before, chrono::Duration::seconds(2));
    /// ```
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        /// A clock reading `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// A clock reading 2025-01-01 00:00:00 UTC.
        ///
        /// # Panics
        ///
        /// Never in practice; the epoch is a constant.
        #[must_use]
        pub fn at_test_epoch() -> Self {
            Self::new(test_epoch())
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

/// Install a test-friendly tracing subscriber. Safe to call from many tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, MockClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::at_test_epoch();
        let handle = clock.clone();
        handle.advance(chrono::Duration::minutes(10));
        assert_eq!(clock.now(), test_clock().now() + chrono::Duration::minutes(10));
    }
}
