//! Provider lookup by name and payment method.

use super::{PaymentError, PaymentProvider, ProviderFactory, SandboxFactory};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Factories and configured providers, keyed by provider name.
pub struct PaymentRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProviderFactory>>>,
    providers: RwLock<HashMap<String, Arc<dyn PaymentProvider>>>,
    fallback: String,
}

impl PaymentRegistry {
    /// An empty registry; unmapped methods resolve to `fallback`.
    #[must_use]
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            fallback: fallback.into(),
        }
    }

    /// A registry with the SSLCommerz, bKash and Nagad factories registered
    /// and a provider of each configured with empty credentials.
    ///
    /// # Errors
    ///
    /// Returns the first factory error, e.g. when live mode is requested.
    pub fn with_defaults(fallback: impl Into<String>, sandbox: bool) -> Result<Self, PaymentError> {
        let registry = Self::new(fallback);
        for factory in [
            SandboxFactory::sslcommerz(),
            SandboxFactory::bkash(),
            SandboxFactory::nagad(),
        ] {
            let name = factory.name().to_string();
            registry.register(&name, Arc::new(factory));
            registry.configure(&name, &serde_json::Value::Null, sandbox)?;
        }
        Ok(registry)
    }

    /// Register a factory under `name`.
    pub fn register(&self, name: &str, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), factory);
    }

    /// Install a ready provider under its own name.
    pub fn install(&self, provider: Arc<dyn PaymentProvider>) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider.name().to_string(), provider);
    }

    /// Build the `name` provider from `credentials` and install it.
    ///
    /// # Errors
    ///
    /// [`PaymentError::GatewayNotFound`] if no factory is registered, or the
    /// factory's error.
    pub fn configure(
        &self,
        name: &str,
        credentials: &serde_json::Value,
        sandbox: bool,
    ) -> Result<(), PaymentError> {
        let provider = self.factory(name)?.create(credentials, sandbox)?;
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), provider);
        tracing::info!(provider = name, sandbox, "Payment provider configured");
        Ok(())
    }

    /// The factory registered under `name`.
    ///
    /// # Errors
    ///
    /// [`PaymentError::GatewayNotFound`].
    pub fn factory(&self, name: &str) -> Result<Arc<dyn ProviderFactory>, PaymentError> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| PaymentError::GatewayNotFound(name.to_string()))
    }

    /// The provider configured under `name`.
    ///
    /// # Errors
    ///
    /// [`PaymentError::GatewayNotFound`].
    pub fn provider(&self, name: &str) -> Result<Arc<dyn PaymentProvider>, PaymentError> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| PaymentError::GatewayNotFound(name.to_string()))
    }

    /// Provider name for a payment method; unmapped methods go to the fallback.
    #[must_use]
    pub fn resolve_provider(&self, method: &str) -> String {
        match method {
            "card" | "bank" | "mobile_bank" => "sslcommerz".to_string(),
            "bkash" => "bkash".to_string(),
            "nagad" => "nagad".to_string(),
            _ => self.fallback.clone(),
        }
    }

    /// The provider serving a payment method.
    ///
    /// # Errors
    ///
    /// [`PaymentError::GatewayNotFound`].
    pub fn provider_for_method(
        &self,
        method: &str,
    ) -> Result<Arc<dyn PaymentProvider>, PaymentError> {
        self.provider(&self.resolve_provider(method))
    }

    /// Extract the order id from a `provider` callback payload.
    ///
    /// # Errors
    ///
    /// [`PaymentError::GatewayNotFound`] or [`PaymentError::MissingField`].
    pub fn parse_order_id(
        &self,
        provider: &str,
        payload: &HashMap<String, String>,
    ) -> Result<String, PaymentError> {
        self.factory(provider)?.parse_order_id(payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_method_resolution() {
        let registry = PaymentRegistry::with_defaults("sslcommerz", true).unwrap();
        assert_eq!(registry.resolve_provider("card"), "sslcommerz");
        assert_eq!(registry.resolve_provider("mobile_bank"), "sslcommerz");
        assert_eq!(registry.resolve_provider("bkash"), "bkash");
        assert_eq!(registry.resolve_provider("nagad"), "nagad");
        assert_eq!(registry.resolve_provider("rocket"), "sslcommerz");
        assert_eq!(registry.provider_for_method("nagad").unwrap().name(), "nagad");
    }

    #[test]
    fn test_unknown_provider() {
        let registry = PaymentRegistry::new("stripe");
        assert!(matches!(
            registry.provider_for_method("card"),
            Err(PaymentError::GatewayNotFound(name)) if name == "sslcommerz"
        ));
    }

    #[test]
    fn test_order_id_field_per_provider() {
        let registry = PaymentRegistry::with_defaults("sslcommerz", true).unwrap();
        let payload = HashMap::from([
            ("tran_id".to_string(), "o-1".to_string()),
            ("merchantInvoiceNumber".to_string(), "o-2".to_string()),
            ("order_id".to_string(), "o-3".to_string()),
        ]);
        assert_eq!(registry.parse_order_id("sslcommerz", &payload).unwrap(), "o-1");
        assert_eq!(registry.parse_order_id("bkash", &payload).unwrap(), "o-2");
        assert_eq!(registry.parse_order_id("nagad", &payload).unwrap(), "o-3");
        assert_eq!(
            registry.parse_order_id("nagad", &HashMap::new()),
            Err(PaymentError::MissingField("order_id"))
        );
    }

    #[test]
    fn test_live_mode_needs_integration() {
        assert!(matches!(
            PaymentRegistry::with_defaults("sslcommerz", false),
            Err(PaymentError::InvalidCredentials { .. })
        ));
    }
}
