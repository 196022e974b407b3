//! Mock price provider for tests: scripted quotes, failures, and delays.

use super::{PriceError, PriceProvider};
use crate::domain::Money;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Scripted price provider.
///
/// Returns the configured quote per instrument, fails for anything not
/// configured (or for everything when `always_failing`), and can delay each
/// answer to exercise resolver timeouts.
#[derive(Debug, Clone)]
pub struct MockPriceProvider {
    name: String,
    prices: HashMap<String, Money>,
    fail_all: bool,
    delay: Option<Duration>,
}

impl MockPriceProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prices: HashMap::new(),
            fail_all: false,
            delay: None,
        }
    }

    /// Script a quote for an instrument.
    pub fn with_price(mut self, instrument: impl Into<String>, price: Money) -> Self {
        self.prices.insert(instrument.into(), price);
        self
    }

    /// Fail every request regardless of scripted quotes.
    pub fn always_failing(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl PriceProvider for MockPriceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn current_price(&self, instrument: &str) -> Result<Money, PriceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all {
            return Err(PriceError::Network(format!(
                "{}: scripted failure",
                self.name
            )));
        }

        self.prices
            .get(instrument)
            .copied()
            .ok_or_else(|| PriceError::Http {
                status: 404,
                message: format!("no scripted price for {}", instrument),
            })
    }
}
