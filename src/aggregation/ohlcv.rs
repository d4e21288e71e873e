// src/aggregation/ohlcv.rs
//! Client-side folding of price updates into per-minute bucket deltas.

use crate::types::{OhlcvBucket, PriceUpdate, TradeSide};
use chrono::{DateTime, Utc};
use itertools::Itertools;

/// Aggregate of one batch's updates for a single `(token, minute)` key.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketDelta {
    pub token_key: String,
    pub bucket_start: DateTime<Utc>,
    /// First price of the batch; only used when the row does not exist yet.
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

impl BucketDelta {
    fn seed(update: &PriceUpdate) -> Self {
        Self {
            token_key: update.token_key.clone(),
            bucket_start: update.bucket_start(),
            open: update.price,
            high: update.price,
            low: update.price,
            close: update.price,
            volume: 0.0,
            trade_count: 0,
            buy_count: 0,
            sell_count: 0,
            market_cap: None,
        }
    }

    fn absorb(&mut self, update: &PriceUpdate) {
        self.high = self.high.max(update.price);
        self.low = self.low.min(update.price);
        self.close = update.price;
        self.volume += update.volume;
        self.trade_count += 1;
        match update.side {
            Some(TradeSide::Buy) => self.buy_count += 1,
            Some(TradeSide::Sell) => self.sell_count += 1,
            None => {}
        }
        if update.market_cap.is_some() {
            self.market_cap = update.market_cap;
        }
    }

    /// The row that results from applying this delta on top of `existing`.
    /// Mirrors the store upsert: open kept, high/low widened, close replaced,
    /// volume and counts added, market cap replaced when present.
    pub fn apply_to(&self, existing: Option<&OhlcvBucket>) -> OhlcvBucket {
        match existing {
            None => OhlcvBucket {
                token_key: self.token_key.clone(),
                bucket_start: self.bucket_start,
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                volume: self.volume,
                trade_count: self.trade_count,
                buy_count: self.buy_count,
                sell_count: self.sell_count,
                market_cap: self.market_cap,
            },
            Some(row) => OhlcvBucket {
                token_key: row.token_key.clone(),
                bucket_start: row.bucket_start,
                open: row.open,
                high: row.high.max(self.high),
                low: row.low.min(self.low),
                close: self.close,
                volume: row.volume + self.volume,
                trade_count: row.trade_count + self.trade_count,
                buy_count: row.buy_count + self.buy_count,
                sell_count: row.sell_count + self.sell_count,
                market_cap: self.market_cap.or(row.market_cap),
            },
        }
    }
}

/// Folds a batch into one delta per `(token, minute)`, keeping per-key
/// insertion order. Output is sorted by key so concurrent writers lock rows
/// in the same order.
pub fn fold_batch(updates: &[PriceUpdate]) -> Vec<BucketDelta> {
    updates
        .iter()
        .into_group_map_by(|u| (u.token_key.clone(), u.bucket_start()))
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .filter_map(|(_, group)| {
            let first = group.first()?;
            let mut delta = BucketDelta::seed(first);
            for update in &group {
                delta.absorb(update);
            }
            Some(delta)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceSource;
    use pretty_assertions::assert_eq;

    const MINUTE: i64 = 1_710_938_040_000;

    fn update(token: &str, price: f64, ts: i64) -> PriceUpdate {
        PriceUpdate::new(token, price, ts, PriceSource::Stream)
    }

    #[test]
    fn test_fold_three_prices_same_minute() {
        let deltas = fold_batch(&[
            update("A", 1.0, MINUTE + 1_000),
            update("A", 1.5, MINUTE + 20_000),
            update("A", 0.8, MINUTE + 59_999),
        ]);
        assert_eq!(deltas.len(), 1);
        let d = &deltas[0];
        assert_eq!((d.open, d.high, d.low, d.close), (1.0, 1.5, 0.8, 0.8));
        assert_eq!(d.trade_count, 3);
    }

    #[test]
    fn test_fold_splits_tokens_and_minutes() {
        let deltas = fold_batch(&[
            update("B", 2.0, MINUTE),
            update("A", 1.0, MINUTE),
            update("A", 3.0, MINUTE + 60_000),
            update("B", 4.0, MINUTE + 1),
        ]);
        let keys: Vec<(&str, i64)> = deltas
            .iter()
            .map(|d| (d.token_key.as_str(), d.bucket_start.timestamp_millis()))
            .collect();
        assert_eq!(keys, vec![("A", MINUTE), ("A", MINUTE + 60_000), ("B", MINUTE)]);
        assert_eq!((deltas[2].open, deltas[2].close), (2.0, 4.0));
    }

    #[test]
    fn test_counts_by_side_and_latest_market_cap() {
        let deltas = fold_batch(&[
            update("A", 1.0, MINUTE).with_volume(2.0, Some(TradeSide::Buy)).with_market_cap(Some(10.0)),
            update("A", 1.1, MINUTE).with_volume(0.5, Some(TradeSide::Sell)),
            update("A", 1.2, MINUTE).with_volume(0.0, None),
        ]);
        let d = &deltas[0];
        assert_eq!((d.buy_count, d.sell_count, d.trade_count), (1, 1, 3));
        assert_eq!(d.volume, 2.5);
        assert_eq!(d.market_cap, Some(10.0));
    }

    /// xorshift64, enough to vary prices and batch boundaries reproducibly.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    #[test]
    fn test_bucket_invariants_over_generated_batches() {
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        for _ in 0..200 {
            let len = 1 + rng.below(40) as usize;
            let updates: Vec<PriceUpdate> = (0..len)
                .map(|i| {
                    let price = 0.001 + rng.below(1_000_000) as f64 / 1_000.0;
                    let side = match rng.below(3) {
                        0 => Some(TradeSide::Buy),
                        1 => Some(TradeSide::Sell),
                        _ => None,
                    };
                    let volume = if side.is_some() { rng.below(500) as f64 / 10.0 } else { 0.0 };
                    update("A", price, MINUTE + i as i64 * 100).with_volume(volume, side)
                })
                .collect();

            let mut row: Option<OhlcvBucket> = None;
            let mut applied = 0;
            while applied < updates.len() {
                let take = 1 + rng.below((updates.len() - applied) as u64) as usize;
                let batch = &updates[applied..applied + take];
                applied += take;

                let deltas = fold_batch(batch);
                assert_eq!(deltas.len(), 1);
                let next = deltas[0].apply_to(row.as_ref());

                let seen = &updates[..applied];
                let max = seen.iter().map(|u| u.price).fold(f64::MIN, f64::max);
                let min = seen.iter().map(|u| u.price).fold(f64::MAX, f64::min);
                assert!(next.low <= next.open && next.open <= next.high);
                assert!(next.low <= next.close && next.close <= next.high);
                assert_eq!(next.open, seen[0].price);
                assert_eq!(next.close, seen[applied - 1].price);
                assert_eq!((next.high, next.low), (max, min));
                assert_eq!(next.trade_count as usize, applied);
                let buys = seen.iter().filter(|u| u.side == Some(TradeSide::Buy)).count();
                let sells = seen.iter().filter(|u| u.side == Some(TradeSide::Sell)).count();
                assert_eq!((next.buy_count as usize, next.sell_count as usize), (buys, sells));
                let volume: f64 = seen.iter().map(|u| u.volume).sum();
                assert!((next.volume - volume).abs() < 1e-6, "{} vs {}", next.volume, volume);

                row = Some(next);
            }
        }
    }

    #[test]
    fn test_apply_keeps_existing_open_and_widens_range() {
        let first = fold_batch(&[update("A", 1.0, MINUTE), update("A", 1.5, MINUTE)]);
        let row = first[0].apply_to(None);
        let second = fold_batch(&[update("A", 0.8, MINUTE + 5)]);
        let row = second[0].apply_to(Some(&row));
        assert_eq!((row.open, row.high, row.low, row.close), (1.0, 1.5, 0.8, 0.8));
        assert_eq!(row.trade_count, 3);
        assert!(row.low <= row.open && row.open <= row.high);
        assert!(row.low <= row.close && row.close <= row.high);
    }
}
