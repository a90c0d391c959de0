//! ORE price in SOL from the Jupiter price API.

use crate::confirm::Completion;
use commonware_runtime::{Clock, Spawner};
use futures::channel::mpsc;
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Wrapped SOL mint.
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq)]
pub struct PriceFeed {
    pub url: String,
    pub ore_mint: Pubkey,
    /// Discount applied to the market price.
    pub multiplier: f64,
    pub interval: Duration,
}

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("price response is missing a usable price for {0}")]
    Missing(String),
}

fn usd_price(body: &Value, mint: &str) -> Option<f64> {
    body.get(mint)?
        .get("usdPrice")?
        .as_f64()
        .filter(|price| price.is_finite() && *price > 0.0)
}

/// ORE priced in SOL (`ore_usd / sol_usd`), before the multiplier.
pub fn parse_price(body: &Value, ore_mint: &str) -> Result<f64, PriceError> {
    let ore = usd_price(body, ore_mint).ok_or_else(|| PriceError::Missing(ore_mint.to_string()))?;
    let sol = usd_price(body, SOL_MINT).ok_or_else(|| PriceError::Missing(SOL_MINT.to_string()))?;
    Ok(ore / sol)
}

impl PriceFeed {
    /// Fetch the current price with the multiplier applied.
    pub async fn fetch(&self, client: &reqwest::Client) -> Result<f64, PriceError> {
        let ore_mint = self.ore_mint.to_string();
        let body: Value = client
            .get(&self.url)
            .query(&[("ids", format!("{ore_mint},{SOL_MINT}"))])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_price(&body, &ore_mint)? * self.multiplier)
    }

    /// Poll forever, reporting each new price to the engine.
    pub fn spawn<E: Clock + Spawner>(self, context: E, completions: mpsc::UnboundedSender<Completion>) {
        context.spawn(move |context| async move {
            let client = reqwest::Client::new();
            loop {
                match self.fetch(&client).await {
                    Ok(price) => {
                        debug!(price, "fetched ore price");
                        if completions.unbounded_send(Completion::Price(price)).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(?err, "failed to fetch ore price"),
                }
                context.sleep(self.interval).await;
            }
        });
    }
}
