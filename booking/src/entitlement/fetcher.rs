//! Subscription service client.

use super::{EntitlementError, Entitlements};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by [`EntitlementFetcher::fetch`].
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Entitlements>, EntitlementError>> + Send + 'a>>;

/// Source of truth for entitlements.
pub trait EntitlementFetcher: Send + Sync {
    /// Fetch an organisation's record; `None` if it has no subscription.
    fn fetch<'a>(&'a self, organization_id: &'a str) -> FetchFuture<'a>;
}

/// Fetches `GET {base}/v1/organizations/{org}/entitlement`.
#[derive(Clone)]
pub struct HttpEntitlementFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEntitlementFetcher {
    /// Client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EntitlementError::Fetch`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EntitlementError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EntitlementError::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl EntitlementFetcher for HttpEntitlementFetcher {
    fn fetch<'a>(&'a self, organization_id: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let url = format!(
                "{}/v1/organizations/{organization_id}/entitlement",
                self.base_url
            );
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| EntitlementError::Fetch(e.to_string()))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(EntitlementError::Fetch(format!(
                    "subscription service returned {}",
                    response.status()
                )));
            }

            response
                .json::<Entitlements>()
                .await
                .map(Some)
                .map_err(|e| EntitlementError::Fetch(e.to_string()))
        })
    }
}
