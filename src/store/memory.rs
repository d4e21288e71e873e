// src/store/memory.rs
//! Process-local store used by tests and dry runs.

use super::{LatestPriceCache, PriceStore};
use crate::aggregation::ohlcv::BucketDelta;
use crate::error::Result;
use crate::pricing::TokenMeta;
use crate::types::{LatestPrice, OhlcvBucket, OhlcvPoint, Resolution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

type BucketKey = (String, DateTime<Utc>);

#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    rows: Mutex<BTreeMap<BucketKey, OhlcvBucket>>,
    tokens: Mutex<HashMap<String, TokenMeta>>,
    upserts: AtomicU64,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: impl IntoIterator<Item = (String, TokenMeta)>) -> Self {
        let store = Self::default();
        store.lock_tokens().extend(tokens);
        store
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<BucketKey, OhlcvBucket>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenMeta>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bucket(&self, mint: &str, bucket_start: DateTime<Utc>) -> Option<OhlcvBucket> {
        self.lock_rows().get(&(mint.to_string(), bucket_start)).cloned()
    }

    pub fn buckets(&self, mint: &str) -> Vec<OhlcvBucket> {
        self.lock_rows()
            .values()
            .filter(|row| row.token_key == mint)
            .cloned()
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.lock_rows().len()
    }

    /// Number of `upsert_buckets` calls that succeeded.
    pub fn upsert_calls(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }
}

fn truncate(ts: DateTime<Utc>, resolution: Resolution) -> i64 {
    let width = resolution.width_secs();
    ts.timestamp().div_euclid(width) * width
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn upsert_buckets(&self, deltas: &[BucketDelta]) -> Result<()> {
        let mut rows = self.lock_rows();
        for delta in deltas {
            let key = (delta.token_key.clone(), delta.bucket_start);
            let next = delta.apply_to(rows.get(&key));
            rows.insert(key, next);
        }
        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_ohlcv(
        &self,
        mint: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>> {
        let mut points: Vec<OhlcvPoint> = Vec::new();
        if from > to {
            return Ok(points);
        }
        let rows = self.lock_rows();
        for row in rows
            .range((mint.to_string(), from)..=(mint.to_string(), to))
            .map(|(_, row)| row)
        {
            let time = truncate(row.bucket_start, resolution);
            match points.last_mut() {
                Some(point) if point.time == time => {
                    point.high = point.high.max(row.high);
                    point.low = point.low.min(row.low);
                    point.close = row.close;
                    point.volume += row.volume;
                    if row.market_cap.is_some() {
                        point.market_cap = row.market_cap;
                    }
                }
                _ => points.push(OhlcvPoint {
                    time,
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                    market_cap: row.market_cap,
                }),
            }
        }
        Ok(points)
    }

    async fn get_latest_price(&self, mint: &str) -> Result<Option<LatestPrice>> {
        Ok(self
            .lock_rows()
            .values()
            .filter(|row| row.token_key == mint)
            .last()
            .map(|row| LatestPrice {
                price: row.close,
                market_cap: row.market_cap,
                time: row.bucket_start.timestamp(),
            }))
    }

    async fn oracle_candidates(&self, exclude: &str) -> Result<Vec<String>> {
        let mut volume: BTreeMap<String, f64> = BTreeMap::new();
        for row in self.lock_rows().values() {
            *volume.entry(row.token_key.clone()).or_default() += row.volume;
        }
        Ok(volume
            .into_iter()
            .filter(|(mint, v)| *v > 0.0 && mint != exclude)
            .map(|(mint, _)| mint)
            .collect())
    }

    async fn load_token_meta(&self) -> Result<Vec<(String, TokenMeta)>> {
        Ok(self
            .lock_tokens()
            .iter()
            .map(|(mint, meta)| (mint.clone(), *meta))
            .collect())
    }
}

/// In-process stand-in for the Redis cache.
#[derive(Debug, Default)]
pub struct MemoryPriceCache {
    entries: DashMap<String, LatestPrice>,
}

impl MemoryPriceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LatestPriceCache for MemoryPriceCache {
    async fn get_latest(&self, mint: &str) -> Result<Option<LatestPrice>> {
        Ok(self.entries.get(mint).map(|entry| entry.value().clone()))
    }

    async fn set_latest(&self, mint: &str, latest: &LatestPrice) -> Result<()> {
        self.entries.insert(mint.to_string(), latest.clone());
        Ok(())
    }
}
