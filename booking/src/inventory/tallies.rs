//! Anti-scalping ticket tallies.
//!
//! Per trip, a user, a client IP and an identity document each have a ticket
//! budget; a user also has an hourly budget across trips. All counters are
//! checked and incremented in one atomic shared-cache operation, so either
//! every counter moves or none does.
//!
//! | Key | Limit | TTL |
//! |-----|-------|-----|
//! | `ticketlimit:{trip}:user:{user}` | 6 | 24h |
//! | `ticketlimit:{trip}:ip:{ip}` | 10 | 24h |
//! | `ticketlimit:{trip}:nid:{doc}` | 1 | 24h |
//! | `ticketlimit:hourly:{user}` | 20 | 1h |

use seatline_core::cache::{SharedCache, Tally};
use std::sync::Arc;
use std::time::Duration;

const TRIP_WINDOW: Duration = Duration::from_secs(24 * 3600);
const HOURLY_WINDOW: Duration = Duration::from_secs(3600);

/// Budgets per counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketLimits {
    /// Per user per trip.
    pub per_user: i64,
    /// Per client IP per trip.
    pub per_ip: i64,
    /// Per identity document per trip.
    pub per_identity: i64,
    /// Per user per hour.
    pub per_hour: i64,
}

impl Default for TicketLimits {
    fn default() -> Self {
        Self {
            per_user: 6,
            per_ip: 10,
            per_identity: 1,
            per_hour: 20,
        }
    }
}

/// Who is buying, for tally purposes.
#[derive(Debug, Clone, Copy)]
pub struct TallySubject<'a> {
    /// Trip.
    pub trip_id: &'a str,
    /// Buyer.
    pub user_id: &'a str,
    /// Buyer's IP, when known.
    pub client_ip: Option<&'a str>,
    /// One identity document per passenger.
    pub identity_documents: &'a [String],
}

/// Result of [`TicketTallies::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TallyOutcome {
    /// Counters incremented.
    Reserved,
    /// A budget would be exceeded; nothing was incremented.
    Exceeded(&'static str),
    /// The shared cache is unreachable; limits were not enforced.
    Skipped,
}

/// Check-and-increment over the shared cache.
#[derive(Clone)]
pub struct TicketTallies {
    cache: Arc<dyn SharedCache>,
    limits: TicketLimits,
}

impl TicketTallies {
    /// Tallies with the given budgets.
    #[must_use]
    pub fn new(cache: Arc<dyn SharedCache>, limits: TicketLimits) -> Self {
        Self { cache, limits }
    }

    /// Reserve `quantity` tickets for `subject`.
    pub async fn reserve(&self, subject: TallySubject<'_>, quantity: i64) -> TallyOutcome {
        let (tallies, reasons) = self.plan(subject, quantity);
        match self.cache.check_and_increment(&tallies).await {
            Ok(None) => TallyOutcome::Reserved,
            Ok(Some(index)) => {
                let reason = reasons.get(index).copied().unwrap_or("user_limit");
                tracing::info!(
                    trip_id = subject.trip_id,
                    user_id = subject.user_id,
                    reason,
                    "Ticket limit reached"
                );
                TallyOutcome::Exceeded(reason)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ticket tallies unavailable, skipping limits");
                TallyOutcome::Skipped
            }
        }
    }

    /// Give back `quantity` tickets. The hourly budget is not refunded.
    pub async fn release(&self, subject: TallySubject<'_>, quantity: i64) {
        let mut keys = vec![user_key(subject.trip_id, subject.user_id)];
        if let Some(ip) = subject.client_ip {
            keys.push(ip_key(subject.trip_id, ip));
        }
        for key in keys {
            if let Err(e) = self.cache.decrement(&key, quantity).await {
                tracing::warn!(key, error = %e, "Failed to release ticket tally");
            }
        }
        for document in subject.identity_documents {
            let key = nid_key(subject.trip_id, document);
            if let Err(e) = self.cache.decrement(&key, 1).await {
                tracing::warn!(key, error = %e, "Failed to release ticket tally");
            }
        }
    }

    fn plan(&self, subject: TallySubject<'_>, quantity: i64) -> (Vec<Tally>, Vec<&'static str>) {
        let mut tallies = vec![Tally {
            key: user_key(subject.trip_id, subject.user_id),
            increment: quantity,
            limit: self.limits.per_user,
            ttl: TRIP_WINDOW,
        }];
        let mut reasons = vec!["user_limit"];

        if let Some(ip) = subject.client_ip {
            tallies.push(Tally {
                key: ip_key(subject.trip_id, ip),
                increment: quantity,
                limit: self.limits.per_ip,
                ttl: TRIP_WINDOW,
            });
            reasons.push("ip_limit");
        }

        for document in subject.identity_documents {
            tallies.push(Tally {
                key: nid_key(subject.trip_id, document),
                increment: 1,
                limit: self.limits.per_identity,
                ttl: TRIP_WINDOW,
            });
            reasons.push("nid_limit");
        }

        tallies.push(Tally {
            key: format!("ticketlimit:hourly:{}", subject.user_id),
            increment: quantity,
            limit: self.limits.per_hour,
            ttl: HOURLY_WINDOW,
        });
        reasons.push("hourly_limit");

        (tallies, reasons)
    }
}

fn user_key(trip_id: &str, user_id: &str) -> String {
    format!("ticketlimit:{trip_id}:user:{user_id}")
}

fn ip_key(trip_id: &str, ip: &str) -> String {
    format!("ticketlimit:{trip_id}:ip:{ip}")
}

fn nid_key(trip_id: &str, document: &str) -> String {
    format!("ticketlimit:{trip_id}:nid:{document}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use seatline_testing::InMemoryCache;

    fn subject<'a>(user: &'a str, docs: &'a [String]) -> TallySubject<'a> {
        TallySubject {
            trip_id: "t1",
            user_id: user,
            client_ip: Some("203.0.113.9"),
            identity_documents: docs,
        }
    }

    #[tokio::test]
    async fn test_user_limit() {
        let cache = Arc::new(InMemoryCache::new());
        let tallies = TicketTallies::new(cache, TicketLimits::default());

        assert_eq!(tallies.reserve(subject("u1", &[]), 4).await, TallyOutcome::Reserved);
        assert_eq!(
            tallies.reserve(subject("u1", &[]), 3).await,
            TallyOutcome::Exceeded("user_limit")
        );
        assert_eq!(tallies.reserve(subject("u1", &[]), 2).await, TallyOutcome::Reserved);
    }

    #[tokio::test]
    async fn test_identity_document_once_per_trip() {
        let cache = Arc::new(InMemoryCache::new());
        let tallies = TicketTallies::new(cache, TicketLimits::default());
        let docs = vec!["1234567890".to_string()];

        assert_eq!(tallies.reserve(subject("u1", &docs), 1).await, TallyOutcome::Reserved);
        assert_eq!(
            tallies.reserve(subject("u2", &docs), 1).await,
            TallyOutcome::Exceeded("nid_limit")
        );
    }

    #[tokio::test]
    async fn test_violation_increments_nothing() {
        let cache = Arc::new(InMemoryCache::new());
        let tallies = TicketTallies::new(cache.clone(), TicketLimits::default());
        let docs = vec!["1234567890".to_string()];
        tallies.reserve(subject("u1", &docs), 1).await;

        tallies.reserve(subject("u1", &docs), 1).await;
        assert_eq!(cache.peek("ticketlimit:t1:user:u1").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_release_frees_trip_budget() {
        let cache = Arc::new(InMemoryCache::new());
        let tallies = TicketTallies::new(cache, TicketLimits::default());
        let docs = vec!["1234567890".to_string()];

        tallies.reserve(subject("u1", &docs), 1).await;
        tallies.release(subject("u1", &docs), 1).await;
        assert_eq!(tallies.reserve(subject("u2", &docs), 1).await, TallyOutcome::Reserved);
    }

    #[tokio::test]
    async fn test_outage_skips_limits() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set_unavailable(true);
        let tallies = TicketTallies::new(cache, TicketLimits::default());
        assert_eq!(tallies.reserve(subject("u1", &[]), 1).await, TallyOutcome::Skipped);
    }
}
