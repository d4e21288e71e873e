// src/store/cache.rs
//! Redis-backed latest-price cache.

use crate::error::{PriceFeedError, Result};
use crate::types::LatestPrice;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::fmt;

const KEY_PREFIX: &str = "price:latest";

#[async_trait]
pub trait LatestPriceCache: Send + Sync {
    async fn get_latest(&self, mint: &str) -> Result<Option<LatestPrice>>;
    async fn set_latest(&self, mint: &str, latest: &LatestPrice) -> Result<()>;
}

/// Uses a `ConnectionManager` so dropped connections are re-established.
#[derive(Clone)]
pub struct RedisPriceCache {
    conn_manager: ConnectionManager,
    ttl_secs: u64,
    redis_url: String,
}

impl fmt::Debug for RedisPriceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisPriceCache")
            .field("redis_url", &self.redis_url)
            .field("ttl_secs", &self.ttl_secs)
            .field("conn_manager", &"<ConnectionManager>")
            .finish()
    }
}

fn key(mint: &str) -> String {
    format!("{}:{}", KEY_PREFIX, mint)
}

impl RedisPriceCache {
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        info!("Connecting latest-price cache to Redis");
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis ConnectionManager: {}", e);
            PriceFeedError::CacheError(format!("connection manager: {}", e))
        })?;
        info!("Redis cache ready, TTL {}s", ttl_secs);
        Ok(Self {
            conn_manager,
            ttl_secs,
            redis_url: redis_url.to_string(),
        })
    }
}

#[async_trait]
impl LatestPriceCache for RedisPriceCache {
    async fn get_latest(&self, mint: &str) -> Result<Option<LatestPrice>> {
        let key = key(mint);
        let mut conn = self.conn_manager.clone();
        match conn.get::<_, Option<String>>(&key).await? {
            Some(raw) => match serde_json::from_str::<LatestPrice>(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    Ok(None)
                }
            },
            None => {
                debug!("Cache MISS for {}", key);
                Ok(None)
            }
        }
    }

    async fn set_latest(&self, mint: &str, latest: &LatestPrice) -> Result<()> {
        let key = key(mint);
        let raw = serde_json::to_string(latest)?;
        let mut conn = self.conn_manager.clone();
        conn.set_ex::<_, _, ()>(&key, raw, self.ttl_secs).await?;
        Ok(())
    }
}
