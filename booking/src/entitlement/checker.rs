//! Cache-first entitlement checks.

use super::{EntitlementError, EntitlementFetcher, Entitlements};
use crate::cache::MultiLevelCache;
use futures::StreamExt;
use seatline_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Pub/sub channel carrying organisation ids whose records changed.
pub const INVALIDATION_CHANNEL: &str = "entitlement:invalidate";

/// Gate behaviour.
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    /// When false every organisation gets a permissive record.
    pub enabled: bool,
    /// Allow when the subscription service cannot be reached.
    pub fail_open: bool,
    /// How long a fetched record is trusted.
    pub cache_ttl: Duration,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Entitlement gate.
pub struct EntitlementChecker {
    fetcher: Arc<dyn EntitlementFetcher>,
    cache: Arc<MultiLevelCache>,
    clock: Arc<dyn Clock>,
    config: EntitlementConfig,
}

impl EntitlementChecker {
    /// Create a checker.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn EntitlementFetcher>,
        cache: Arc<MultiLevelCache>,
        clock: Arc<dyn Clock>,
        config: EntitlementConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            clock,
            config,
        }
    }

    /// The organisation's record, from cache or the subscription service.
    ///
    /// # Errors
    ///
    /// - [`EntitlementError::NoSubscription`] if the service has no record
    /// - [`EntitlementError::Fetch`] if the service is unreachable and the gate fails closed
    pub async fn check_entitlement(
        &self,
        organization_id: &str,
    ) -> Result<Entitlements, EntitlementError> {
        let now = self.clock.now();
        if !self.config.enabled {
            return Ok(Entitlements::permissive(organization_id, now));
        }

        let key = cache_key(organization_id);
        if let Some(cached) = self.cache.get_json::<Entitlements>(&key).await {
            return Ok(cached);
        }

        match self.fetcher.fetch(organization_id).await {
            Ok(Some(mut record)) => {
                record.cached_at = Some(now);
                self.cache
                    .set_json(&key, &record, Some(self.config.cache_ttl))
                    .await;
                Ok(record)
            }
            Ok(None) => Err(EntitlementError::NoSubscription(organization_id.to_string())),
            Err(e) if self.config.fail_open => {
                tracing::warn!(
                    organization_id,
                    error = %e,
                    "Subscription service unreachable, failing open"
                );
                Ok(Entitlements::permissive(organization_id, now))
            }
            Err(e) => {
                tracing::error!(organization_id, error = %e, "Subscription service unreachable");
                Err(e)
            }
        }
    }

    /// Whether the organisation's plan includes `feature`.
    ///
    /// # Errors
    ///
    /// As [`check_entitlement`](Self::check_entitlement).
    pub async fn has_feature(
        &self,
        organization_id: &str,
        feature: &str,
    ) -> Result<bool, EntitlementError> {
        if !self.config.enabled {
            return Ok(true);
        }
        Ok(self.check_entitlement(organization_id).await?.has_feature(feature))
    }

    /// Require an active subscription with room for `requested` more units of
    /// `resource`.
    ///
    /// # Errors
    ///
    /// [`EntitlementError::Inactive`], [`EntitlementError::QuotaExceeded`], or
    /// any error of [`check_entitlement`](Self::check_entitlement).
    pub async fn check_quota(
        &self,
        organization_id: &str,
        resource: &str,
        requested: i64,
    ) -> Result<(), EntitlementError> {
        let record = self.check_entitlement(organization_id).await?;
        if !record.is_active() {
            return Err(EntitlementError::Inactive(record.status));
        }
        record.check_quota(resource, requested)
    }

    /// Drop the organisation's record here and ask every node to do the same.
    pub async fn invalidate_cache(&self, organization_id: &str) {
        let key = cache_key(organization_id);
        self.cache.delete(&key).await;
        if let Err(e) = self
            .cache
            .shared()
            .publish(INVALIDATION_CHANNEL, organization_id)
            .await
        {
            tracing::warn!(organization_id, error = %e, "Failed to broadcast entitlement invalidation");
        }
        tracing::info!(organization_id, "Entitlement cache invalidated");
    }

    /// Drop local copies named on the invalidation channel until `shutdown`.
    pub async fn listen_for_invalidations(&self, mut shutdown: watch::Receiver<bool>) {
        let mut messages = match self.cache.shared().subscribe(INVALIDATION_CHANNEL).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Entitlement invalidation listener not started");
                return;
            }
        };
        tracing::info!("Entitlement invalidation listener started");

        loop {
            tokio::select! {
                message = messages.next() => {
                    let Some(organization_id) = message else {
                        tracing::warn!("Entitlement invalidation channel closed");
                        break;
                    };
                    self.cache.invalidate_local(&cache_key(&organization_id));
                    tracing::debug!(organization_id, "Dropped local entitlement record");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn cache_key(organization_id: &str) -> String {
    format!("entitlement:{organization_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::entitlement::{FetchFuture, MAX_BOOKINGS_PER_MONTH};
    use seatline_testing::{InMemoryCache, test_clock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFetcher {
        record: Option<Entitlements>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl EntitlementFetcher for FakeFetcher {
        fn fetch<'a>(&'a self, _organization_id: &'a str) -> FetchFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(EntitlementError::Fetch("connection refused".into()))
            } else {
                Ok(self.record.clone())
            };
            Box::pin(async move { result })
        }
    }

    fn record(status: &str, used: i64) -> Entitlements {
        let mut e = Entitlements::permissive("org", test_clock().now());
        e.status = status.to_string();
        e.quota_limits.insert(MAX_BOOKINGS_PER_MONTH.into(), 100);
        e.usage_this_period.insert(MAX_BOOKINGS_PER_MONTH.into(), used);
        e
    }

    fn checker(
        fetcher: Arc<FakeFetcher>,
        config: EntitlementConfig,
    ) -> (EntitlementChecker, Arc<InMemoryCache>) {
        let clock = Arc::new(test_clock());
        let shared = Arc::new(InMemoryCache::new());
        let cache = Arc::new(MultiLevelCache::new(
            shared.clone(),
            clock.clone(),
            CacheConfig::default(),
        ));
        (EntitlementChecker::new(fetcher, cache, clock, config), shared)
    }

    fn fetcher(record: Option<Entitlements>, fail: bool) -> Arc<FakeFetcher> {
        Arc::new(FakeFetcher {
            record,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_cached_after_first_fetch() {
        let source = fetcher(Some(record("active", 0)), false);
        let (checker, shared) = checker(source.clone(), EntitlementConfig::default());

        checker.check_entitlement("org").await.unwrap();
        checker.check_entitlement("org").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(shared.peek("entitlement:org").is_some());
    }

    #[tokio::test]
    async fn test_invalidation_forces_refetch() {
        let source = fetcher(Some(record("active", 0)), false);
        let (checker, _) = checker(source.clone(), EntitlementConfig::default());

        checker.check_entitlement("org").await.unwrap();
        checker.invalidate_cache("org").await;
        checker.check_entitlement("org").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_quota_exhausted() {
        let source = fetcher(Some(record("active", 100)), false);
        let (checker, _) = checker(source, EntitlementConfig::default());
        let err = checker
            .check_quota("org", MAX_BOOKINGS_PER_MONTH, 1)
            .await
            .unwrap_err();
        assert!(err.is_quota());
    }

    #[tokio::test]
    async fn test_inactive_subscription_denied() {
        let source = fetcher(Some(record("canceled", 0)), false);
        let (checker, _) = checker(source, EntitlementConfig::default());
        assert_eq!(
            checker.check_quota("org", MAX_BOOKINGS_PER_MONTH, 1).await,
            Err(EntitlementError::Inactive("canceled".into()))
        );
    }

    #[tokio::test]
    async fn test_missing_subscription() {
        let (checker, _) = checker(fetcher(None, false), EntitlementConfig::default());
        assert!(matches!(
            checker.check_entitlement("org").await,
            Err(EntitlementError::NoSubscription(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_open_and_fail_closed() {
        let (open, _) = checker(fetcher(None, true), EntitlementConfig::default());
        assert!(open.check_quota("org", MAX_BOOKINGS_PER_MONTH, 1).await.is_ok());

        let (closed, _) = checker(
            fetcher(None, true),
            EntitlementConfig {
                fail_open: false,
                ..EntitlementConfig::default()
            },
        );
        assert!(matches!(
            closed.check_quota("org", MAX_BOOKINGS_PER_MONTH, 1).await,
            Err(EntitlementError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_gate_never_fetches() {
        let source = fetcher(None, true);
        let (checker, _) = checker(
            source.clone(),
            EntitlementConfig {
                enabled: false,
                ..EntitlementConfig::default()
            },
        );
        assert!(checker.has_feature("org", "anything").await.unwrap());
        checker.check_quota("org", MAX_BOOKINGS_PER_MONTH, 1).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
