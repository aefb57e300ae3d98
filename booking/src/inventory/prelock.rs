//! Advisory per-row leases in the shared cache.
//!
//! A lease is `SETNX inventory:lock:{org}:{trip}:{segment}:{seat} = owner` with a
//! short TTL. It only spares the authoritative store from doomed CAS traffic;
//! correctness never depends on it. Release is value-checked, so a lease that
//! expired and was re-taken by someone else is left alone.

use seatline_core::cache::SharedCache;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`PreLocks::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreLockOutcome {
    /// Every lease was taken.
    Acquired,
    /// Another caller holds `key`; leases taken so far are released.
    Contended {
        /// The contended lease.
        key: String,
    },
    /// The shared cache is unreachable; proceed on the store's CAS alone.
    Skipped,
}

/// Leases held by one attempt.
#[derive(Debug, Default)]
pub struct PreLockGuard {
    keys: Vec<String>,
    owner: String,
}

/// Acquires and releases pre-locks.
#[derive(Clone)]
pub struct PreLocks {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl PreLocks {
    /// Leases live for `ttl` unless released earlier.
    #[must_use]
    pub fn new(cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Key of the lease for one row.
    #[must_use]
    pub fn key(org_id: &str, trip_id: &str, segment: u32, seat_id: &str) -> String {
        format!("inventory:lock:{org_id}:{trip_id}:{segment}:{seat_id}")
    }

    /// Take every lease in `keys` for `owner`, in order, failing fast on the
    /// first contended one.
    pub async fn acquire(&self, keys: Vec<String>, owner: &str) -> (PreLockOutcome, PreLockGuard) {
        let mut guard = PreLockGuard {
            keys: Vec::with_capacity(keys.len()),
            owner: owner.to_string(),
        };

        for key in keys {
            match self.cache.set_nx(&key, owner, self.ttl).await {
                Ok(true) => guard.keys.push(key),
                Ok(false) => {
                    tracing::debug!(key, "Pre-lock contended");
                    self.release(std::mem::take(&mut guard)).await;
                    return (PreLockOutcome::Contended { key }, PreLockGuard::default());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Pre-lock unavailable, relying on store CAS");
                    self.release(std::mem::take(&mut guard)).await;
                    return (PreLockOutcome::Skipped, PreLockGuard::default());
                }
            }
        }

        (PreLockOutcome::Acquired, guard)
    }

    /// Release the leases in `guard` that still carry its owner.
    pub async fn release(&self, guard: PreLockGuard) {
        for key in &guard.keys {
            if let Err(e) = self.cache.delete_if_equals(key, &guard.owner).await {
                tracing::debug!(key, error = %e, "Pre-lock release failed, leaving it to expire");
            }
        }
    }

    /// Release `guard` on a background task bounded by `timeout`.
    pub fn release_later(&self, guard: PreLockGuard, timeout: Duration) {
        if guard.keys.is_empty() {
            return;
        }
        let locks = self.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, locks.release(guard)).await.is_err() {
                tracing::debug!("Pre-lock release timed out, leases will expire");
            }
        });
    }
}
