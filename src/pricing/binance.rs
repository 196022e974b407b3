//! Primary price source backed by the public Binance spot ticker API.

use super::{PriceError, PriceProvider};
use crate::domain::Money;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Spot ticker client for `GET /api/v3/ticker/price`.
#[derive(Debug, Clone)]
pub struct BinancePriceProvider {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: String,
}

impl BinancePriceProvider {
    /// Create a provider against `base_url` (no trailing slash).
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    /// Create with the public Binance API URL.
    pub fn default_url() -> Self {
        Self::new("https://api.binance.com".to_string())
    }

    async fn fetch_ticker(&self, instrument: &str) -> Result<TickerResponse, PriceError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        // Retries stay well inside the resolver's per-provider timeout; the
        // fallback provider is the real availability guarantee.
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(2)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .get(&url)
                .query(&[("symbol", instrument)])
                .send()
                .await
                .map_err(|e| backoff::Error::transient(PriceError::Network(e.to_string())))?;

            let status = response.status();
            if status.is_server_error() || status == 429 {
                return Err(backoff::Error::transient(PriceError::Http {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(PriceError::Http {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response
                .json::<TickerResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(PriceError::Parse(e.to_string())))
        })
        .await
    }
}

#[async_trait]
impl PriceProvider for BinancePriceProvider {
    fn name(&self) -> &str {
        "binance"
    }

    async fn current_price(&self, instrument: &str) -> Result<Money, PriceError> {
        debug!(instrument, "fetching ticker price");
        let ticker = self.fetch_ticker(instrument).await?;

        let price = Money::from_str(&ticker.price)
            .map_err(|e| PriceError::Parse(format!("bad price {:?}: {}", ticker.price, e)))?;

        if !price.is_positive() {
            return Err(PriceError::Parse(format!(
                "non-positive price for {}: {}",
                instrument, price
            )));
        }

        Ok(price)
    }
}
