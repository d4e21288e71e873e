// src/oracle/client.rs

use crate::error::{PriceFeedError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Batch USD price source keyed by mint address.
#[async_trait]
pub trait OracleClient: Send + Sync {
    /// Ids absent from the result had no price. A rejected or throttled
    /// request yields an empty map rather than an error.
    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, f64>>;
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    data: HashMap<String, Option<PriceEntry>>,
}

#[derive(Debug, Deserialize)]
struct PriceEntry {
    price: PriceValue,
}

/// The price API reports prices as decimal strings; older versions used
/// plain numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Text(String),
    Number(f64),
}

impl PriceValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            PriceValue::Text(s) => s.parse().ok(),
            PriceValue::Number(n) => Some(*n),
        }
    }
}

/// Jupiter price v2 client.
#[derive(Debug, Clone)]
pub struct JupiterPriceClient {
    http: Client,
    base_url: String,
}

impl JupiterPriceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PriceFeedError::ConfigError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

fn parse_prices(body: PriceResponse) -> HashMap<String, f64> {
    body.data
        .into_iter()
        .filter_map(|(id, entry)| {
            let price = entry?.price.as_f64()?;
            (price.is_finite() && price > 0.0).then_some((id, price))
        })
        .collect()
}

#[async_trait]
impl OracleClient for JupiterPriceClient {
    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, f64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("ids", ids.join(","))])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Price API throttled a batch of {} ids", ids.len());
            return Ok(HashMap::new());
        }
        if !status.is_success() {
            warn!("Price API returned {} for a batch of {} ids", status, ids.len());
            return Ok(HashMap::new());
        }

        let body: PriceResponse = response.json().await?;
        let prices = parse_prices(body);
        debug!("Price API returned {}/{} prices", prices.len(), ids.len());
        Ok(prices)
    }
}
