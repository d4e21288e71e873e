use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster an upstream connection is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Devnet,
    Mainnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Devnet => write!(f, "devnet"),
            Network::Mainnet => write!(f, "mainnet"),
        }
    }
}

/// Which pipeline produced a price point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Stream,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single price observation on its way to the aggregation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub token_key: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: i64,
    pub source: PriceSource,
    pub side: Option<TradeSide>,
    pub market_cap: Option<f64>,
}

impl PriceUpdate {
    pub fn new(token_key: impl Into<String>, price: f64, timestamp_ms: i64, source: PriceSource) -> Self {
        Self {
            token_key: token_key.into(),
            price,
            volume: 0.0,
            timestamp_ms,
            source,
            side: None,
            market_cap: None,
        }
    }

    pub fn with_volume(mut self, volume: f64, side: Option<TradeSide>) -> Self {
        self.volume = volume;
        self.side = side;
        self
    }

    pub fn with_market_cap(mut self, market_cap: Option<f64>) -> Self {
        self.market_cap = market_cap;
        self
    }

    /// Price is strictly positive and finite, volume is finite and not negative.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.volume.is_finite() && self.volume >= 0.0
    }

    pub fn bucket_start(&self) -> DateTime<Utc> {
        minute_bucket(self.timestamp_ms)
    }
}

/// Truncates an epoch-millisecond timestamp to the start of its minute.
pub fn minute_bucket(timestamp_ms: i64) -> DateTime<Utc> {
    let floored = timestamp_ms.div_euclid(60_000) * 60_000;
    Utc.timestamp_millis_opt(floored)
        .single()
        .unwrap_or_default()
}

/// One persisted OHLCV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBucket {
    pub token_key: String,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: i32,
    pub buy_count: i32,
    pub sell_count: i32,
    pub market_cap: Option<f64>,
}

/// Chart point returned by history queries. `time` is epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvPoint {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPrice {
    pub price: f64,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    /// Epoch seconds of the bucket holding this close.
    pub time: i64,
}

/// Bucket width used by history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Minute,
    Hour,
    Day,
}

impl Resolution {
    /// Chart-style resolution strings: `"D"` is daily, a minute count of 60
    /// or more is hourly, anything else is one-minute buckets.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("d") || raw.eq_ignore_ascii_case("1d") {
            return Resolution::Day;
        }
        match raw.parse::<u32>() {
            Ok(minutes) if minutes >= 60 => Resolution::Hour,
            _ => Resolution::Minute,
        }
    }

    pub fn date_trunc_unit(&self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
        }
    }

    pub fn width_secs(&self) -> i64 {
        match self {
            Resolution::Minute => 60,
            Resolution::Hour => 3_600,
            Resolution::Day => 86_400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_bucket_truncates() {
        // 2024-03-20T12:34:56.789Z
        let ts = 1_710_938_096_789;
        let bucket = minute_bucket(ts);
        assert_eq!(bucket.timestamp_millis(), 1_710_938_040_000);
        assert_eq!(minute_bucket(1_710_938_040_000), bucket);
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!(Resolution::parse("D"), Resolution::Day);
        assert_eq!(Resolution::parse("60"), Resolution::Hour);
        assert_eq!(Resolution::parse("240"), Resolution::Hour);
        assert_eq!(Resolution::parse("15"), Resolution::Minute);
        assert_eq!(Resolution::parse("garbage"), Resolution::Minute);
    }

    #[test]
    fn test_price_update_validity() {
        let ok = PriceUpdate::new("mint", 1.5, 0, PriceSource::Poll);
        assert!(ok.is_valid());
        assert!(!PriceUpdate::new("mint", 0.0, 0, PriceSource::Poll).is_valid());
        assert!(!PriceUpdate::new("mint", f64::NAN, 0, PriceSource::Poll).is_valid());
        assert!(!PriceUpdate::new("mint", f64::INFINITY, 0, PriceSource::Poll).is_valid());
        assert!(!ok.with_volume(-1.0, None).is_valid());
    }
}
