//! Durable OHLCV storage and the latest-price cache.

pub mod cache;
pub mod memory;
pub mod postgres;

pub use cache::{LatestPriceCache, RedisPriceCache};
pub use memory::{MemoryPriceCache, MemoryPriceStore};
pub use postgres::PgPriceStore;

use crate::aggregation::ohlcv::BucketDelta;
use crate::error::Result;
use crate::pricing::TokenMeta;
use crate::types::{LatestPrice, OhlcvPoint, Resolution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use std::sync::Arc;

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Applies each delta as one atomic upsert of its bucket row.
    async fn upsert_buckets(&self, deltas: &[BucketDelta]) -> Result<()>;

    /// Buckets for `mint` in `[from, to]`, re-aggregated to `resolution`,
    /// ordered by time.
    async fn get_ohlcv(
        &self,
        mint: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>>;

    async fn get_latest_price(&self, mint: &str) -> Result<Option<LatestPrice>>;

    /// Mints with nonzero recorded volume, minus `exclude`.
    async fn oracle_candidates(&self, exclude: &str) -> Result<Vec<String>>;

    async fn load_token_meta(&self) -> Result<Vec<(String, TokenMeta)>>;
}

/// Read side used by the history handlers: cache first for the latest price.
pub struct PriceQueries {
    store: Arc<dyn PriceStore>,
    cache: Option<Arc<dyn LatestPriceCache>>,
}

impl PriceQueries {
    pub fn new(store: Arc<dyn PriceStore>, cache: Option<Arc<dyn LatestPriceCache>>) -> Self {
        Self { store, cache }
    }

    pub async fn get_ohlcv(
        &self,
        mint: &str,
        resolution: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>> {
        self.store.get_ohlcv(mint, Resolution::parse(resolution), from, to).await
    }

    pub async fn get_latest_price(&self, mint: &str) -> Result<Option<LatestPrice>> {
        if let Some(cache) = &self.cache {
            match cache.get_latest(mint).await {
                Ok(Some(latest)) => return Ok(Some(latest)),
                Ok(None) => {}
                Err(e) => warn!("Latest-price cache read failed for {}: {}", mint, e),
            }
        }
        let latest = self.store.get_latest_price(mint).await?;
        if let (Some(cache), Some(value)) = (&self.cache, &latest) {
            if let Err(e) = cache.set_latest(mint, value).await {
                warn!("Latest-price cache backfill failed for {}: {}", mint, e);
            }
        }
        Ok(latest)
    }
}
