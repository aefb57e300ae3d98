//! Deadlines propagated from an entry point to every outbound call.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Returned when a [`Deadline`] elapses before the guarded future completes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// A point in time after which work on behalf of a caller should stop.
///
/// `Deadline::none()` never expires. Deadlines are `Copy` so they can be
/// threaded through every layer without ceremony.
///
/// # Example
///
/// ```
/// use seatline_core::deadline::Deadline;
/// use std::time::Duration;
///
/// # async fn example() {
/// let deadline = Deadline::after(Duration::from_secs(2));
/// let value = deadline.run(async { 42 }).await;
/// assert_eq!(value, Ok(42));
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    #[must_use]
    pub const fn none() -> Self {
        Self { at: None }
    }

    /// Expires `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    /// Expires at the given instant.
    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// The instant this deadline expires, if any.
    #[must_use]
    pub const fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left, or `None` when unbounded. Saturates at zero.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// True once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// The earlier of this deadline and `timeout` from now.
    ///
    /// Used to apply a hard per-call bound without extending the caller's budget.
    #[must_use]
    pub fn tighten(self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        match self.at {
            Some(at) if at <= candidate => self,
            _ => Self { at: Some(candidate) },
        }
    }

    /// Runs `fut` to completion unless the deadline passes first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineExceeded`] if the deadline elapses first.
    pub async fn run<F>(self, fut: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        match self.at {
            None => Ok(fut.await),
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| DeadlineExceeded),
        }
    }
}
