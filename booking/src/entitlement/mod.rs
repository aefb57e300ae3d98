//! Subscription entitlements and the quota gate.
//!
//! Quota-bounded mutations ask [`EntitlementChecker`] whether the organisation
//! may proceed. Records come from the subscription service and are cached in
//! both cache levels; invalidation is broadcast so every node drops its copy.

mod checker;
mod fetcher;

pub use checker::{EntitlementChecker, EntitlementConfig, INVALIDATION_CHANNEL};
pub use fetcher::{EntitlementFetcher, FetchFuture, HttpEntitlementFetcher};

use chrono::{DateTime, Utc};
use seatline_core::error::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Monthly bookings quota resource.
pub const MAX_BOOKINGS_PER_MONTH: &str = "max_bookings_per_month";

/// Enforcement record for one organisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlements {
    /// Organisation.
    pub organization_id: String,
    /// Plan id.
    pub plan_id: String,
    /// Plan display name.
    pub plan_name: String,
    /// Subscription status (`active`, `trialing`, `past_due`, ...).
    pub status: String,
    /// Feature flags and values.
    #[serde(default)]
    pub features: HashMap<String, String>,
    /// Usage per quota resource in the current period.
    #[serde(default)]
    pub usage_this_period: HashMap<String, i64>,
    /// Limit per quota resource; 0 means unlimited.
    #[serde(default)]
    pub quota_limits: HashMap<String, i64>,
    /// Billing period start.
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
    /// Billing period end.
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
    /// When this node fetched the record.
    #[serde(default)]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Entitlements {
    /// An active record with no limits, used when enforcement is off.
    #[must_use]
    pub fn permissive(organization_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            plan_id: "unlimited".to_string(),
            plan_name: "Unlimited".to_string(),
            status: "active".to_string(),
            features: HashMap::new(),
            usage_this_period: HashMap::new(),
            quota_limits: HashMap::new(),
            period_start: None,
            period_end: None,
            cached_at: Some(now),
        }
    }

    /// Active or trialing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    /// A feature is on when its value is `"true"`, `"1"` or a positive number.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.get(feature).is_some_and(|value| {
            value == "true" || value == "1" || value.parse::<f64>().is_ok_and(|n| n > 0.0)
        })
    }

    /// Check that `requested` more units of `resource` fit the period quota.
    ///
    /// # Errors
    ///
    /// [`EntitlementError::QuotaExceeded`] if the limit would be passed.
    pub fn check_quota(&self, resource: &str, requested: i64) -> Result<(), EntitlementError> {
        let limit = self.quota_limits.get(resource).copied().unwrap_or(0);
        if limit <= 0 {
            return Ok(());
        }
        let used = self.usage_this_period.get(resource).copied().unwrap_or(0);
        if used.saturating_add(requested) > limit {
            return Err(EntitlementError::QuotaExceeded {
                resource: resource.to_string(),
                used,
                limit,
            });
        }
        Ok(())
    }
}

/// Entitlement gate errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntitlementError {
    /// The subscription service knows no subscription for the organisation.
    #[error("organization {0} has no subscription")]
    NoSubscription(String),

    /// The subscription exists but is not active.
    #[error("subscription is {0}")]
    Inactive(String),

    /// The period quota is used up.
    #[error("quota exceeded for {resource}: {used}/{limit}")]
    QuotaExceeded {
        /// Quota resource.
        resource: String,
        /// Units used this period.
        used: i64,
        /// Period limit.
        limit: i64,
    },

    /// The plan does not include a feature.
    #[error("feature {0} is not available on this plan")]
    FeatureUnavailable(String),

    /// The subscription service could not be reached.
    #[error("entitlement fetch failed: {0}")]
    Fetch(String),
}

impl EntitlementError {
    /// True for exhausted quotas, which the edge reports as 429.
    #[must_use]
    pub const fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

impl Classify for EntitlementError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::Transient,
            _ => ErrorKind::Entitlement,
        }
    }
}
