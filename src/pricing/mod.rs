//! Price oracle abstraction with explicit fallback chaining.
//!
//! Settlement never trusts a stored `current_price`; it asks the resolver for
//! a fresh quote at settlement time. The resolver tries an ordered list of
//! providers with a per-provider timeout and returns the first success, so an
//! outage of the primary market-data source degrades price precision instead
//! of availability.

use crate::domain::Money;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub mod binance;
pub mod mock;
pub mod simulated;

pub use binance::BinancePriceProvider;
pub use mock::MockPriceProvider;
pub use simulated::SimulatedPriceProvider;

/// A single source of current prices for an instrument.
#[async_trait]
pub trait PriceProvider: Send + Sync + fmt::Debug {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    /// Fetch the current price for `instrument` (e.g. "BTCUSDT").
    ///
    /// # Errors
    /// Returns an error if the quote cannot be obtained; the resolver moves on
    /// to the next provider in the chain.
    async fn current_price(&self, instrument: &str) -> Result<Money, PriceError>;
}

/// Error type for price-source operations.
#[derive(Debug, Clone)]
pub enum PriceError {
    /// Network error (connection refused, DNS failure, ...).
    Network(String),
    /// HTTP error from the upstream API.
    Http { status: u16, message: String },
    /// Malformed or unexpected response body.
    Parse(String),
    /// A single provider exceeded its per-lookup timeout.
    Timeout { provider: String },
    /// Every provider in the chain failed.
    Unavailable { instrument: String },
}

impl fmt::Display for PriceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceError::Network(msg) => write!(f, "Network error: {}", msg),
            PriceError::Http { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            PriceError::Parse(msg) => write!(f, "Parse error: {}", msg),
            PriceError::Timeout { provider } => write!(f, "Provider {} timed out", provider),
            PriceError::Unavailable { instrument } => {
                write!(f, "No price source available for {}", instrument)
            }
        }
    }
}

impl std::error::Error for PriceError {}

/// Ordered chain of price providers with a shared per-provider timeout.
#[derive(Debug, Clone)]
pub struct PriceResolver {
    providers: Vec<Arc<dyn PriceProvider>>,
    per_provider_timeout: Duration,
}

impl PriceResolver {
    /// Build a resolver over `providers`, tried in order.
    ///
    /// `per_provider_timeout` bounds each attempt so a hung source cannot
    /// stall an auto-close sweep.
    pub fn new(providers: Vec<Arc<dyn PriceProvider>>, per_provider_timeout: Duration) -> Self {
        PriceResolver {
            providers,
            per_provider_timeout,
        }
    }

    /// Resolve the current price, falling through the provider chain.
    ///
    /// # Errors
    /// Returns `PriceError::Unavailable` when every provider fails or times out.
    pub async fn resolve(&self, instrument: &str) -> Result<Money, PriceError> {
        for provider in &self.providers {
            let attempt =
                tokio::time::timeout(self.per_provider_timeout, provider.current_price(instrument))
                    .await;

            match attempt {
                Ok(Ok(price)) => return Ok(price),
                Ok(Err(err)) => {
                    warn!(
                        provider = provider.name(),
                        instrument,
                        error = %err,
                        "price provider failed, falling through"
                    );
                }
                Err(_) => {
                    warn!(
                        provider = provider.name(),
                        instrument, "price provider timed out, falling through"
                    );
                }
            }
        }

        Err(PriceError::Unavailable {
            instrument: instrument.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn money(s: &str) -> Money {
        Money::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_resolver_returns_first_success() {
        let primary = Arc::new(MockPriceProvider::new("primary").with_price("BTCUSDT", money("50000")));
        let fallback =
            Arc::new(MockPriceProvider::new("fallback").with_price("BTCUSDT", money("49000")));

        let resolver = PriceResolver::new(vec![primary, fallback], Duration::from_secs(1));
        let price = resolver.resolve("BTCUSDT").await.unwrap();
        assert_eq!(price, money("50000"));
    }

    #[tokio::test]
    async fn test_resolver_falls_through_on_failure() {
        let primary = Arc::new(MockPriceProvider::new("primary").always_failing());
        let fallback =
            Arc::new(MockPriceProvider::new("fallback").with_price("BTCUSDT", money("49000")));

        let resolver = PriceResolver::new(vec![primary, fallback], Duration::from_secs(1));
        let price = resolver.resolve("BTCUSDT").await.unwrap();
        assert_eq!(price, money("49000"));
    }

    #[tokio::test]
    async fn test_resolver_unavailable_when_all_fail() {
        let primary = Arc::new(MockPriceProvider::new("primary").always_failing());
        let fallback = Arc::new(MockPriceProvider::new("fallback").always_failing());

        let resolver = PriceResolver::new(vec![primary, fallback], Duration::from_secs(1));
        let err = resolver.resolve("ETHUSDT").await.unwrap_err();
        assert!(matches!(err, PriceError::Unavailable { instrument } if instrument == "ETHUSDT"));
    }

    #[tokio::test]
    async fn test_resolver_times_out_slow_provider() {
        let slow = Arc::new(
            MockPriceProvider::new("slow")
                .with_price("BTCUSDT", money("50000"))
                .with_delay(Duration::from_millis(200)),
        );
        let fallback =
            Arc::new(MockPriceProvider::new("fallback").with_price("BTCUSDT", money("48000")));

        let resolver = PriceResolver::new(vec![slow, fallback], Duration::from_millis(20));
        let price = resolver.resolve("BTCUSDT").await.unwrap();
        assert_eq!(price, money("48000"));
    }

    #[test]
    fn test_price_error_display() {
        let err = PriceError::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "Network error: connection refused");

        let err = PriceError::Unavailable {
            instrument: "BTCUSDT".to_string(),
        };
        assert_eq!(err.to_string(), "No price source available for BTCUSDT");
    }
}
