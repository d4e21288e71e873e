// src/store/postgres.rs

use super::PriceStore;
use crate::aggregation::ohlcv::BucketDelta;
use crate::error::Result;
use crate::pricing::TokenMeta;
use crate::types::{LatestPrice, OhlcvPoint, Resolution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;

/// Rows per INSERT statement; 11 binds each stays far below the 65535 limit.
const ROWS_PER_STATEMENT: usize = 1_000;

const CREATE_PRICE_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS price_history (
    mint_address TEXT NOT NULL,
    bucket_time  TIMESTAMPTZ NOT NULL,
    open         NUMERIC NOT NULL,
    high         NUMERIC NOT NULL,
    low          NUMERIC NOT NULL,
    close        NUMERIC NOT NULL,
    volume       NUMERIC NOT NULL DEFAULT 0,
    trade_count  INTEGER NOT NULL DEFAULT 0,
    buy_count    INTEGER NOT NULL DEFAULT 0,
    sell_count   INTEGER NOT NULL DEFAULT 0,
    market_cap   NUMERIC,
    PRIMARY KEY (mint_address, bucket_time)
)"#;

const CREATE_TOKENS: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    mint_address TEXT PRIMARY KEY,
    decimals     SMALLINT NOT NULL DEFAULT 6,
    total_supply NUMERIC
)"#;

const UPSERT_SUFFIX: &str = r#"
ON CONFLICT (mint_address, bucket_time) DO UPDATE SET
    high        = GREATEST(price_history.high, EXCLUDED.high),
    low         = LEAST(price_history.low, EXCLUDED.low),
    close       = EXCLUDED.close,
    volume      = price_history.volume + EXCLUDED.volume,
    trade_count = price_history.trade_count + EXCLUDED.trade_count,
    buy_count   = price_history.buy_count + EXCLUDED.buy_count,
    sell_count  = price_history.sell_count + EXCLUDED.sell_count,
    market_cap  = COALESCE(EXCLUDED.market_cap, price_history.market_cap)"#;

#[derive(Debug, FromRow)]
struct PointRow {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    market_cap: Option<f64>,
}

#[derive(Debug, FromRow)]
struct LatestRow {
    close: f64,
    market_cap: Option<f64>,
    time: i64,
}

#[derive(Debug, FromRow)]
struct TokenRow {
    mint_address: String,
    decimals: i16,
    total_supply: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PgPriceStore {
    pool: PgPool,
}

impl PgPriceStore {
    /// Builds the pool. Failure here is the one fatal startup condition.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to Postgres (max {} connections)", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_PRICE_HISTORY).execute(&self.pool).await?;
        sqlx::query(CREATE_TOKENS).execute(&self.pool).await?;
        info!("price_history / tokens schema ready");
        Ok(())
    }
}

fn upsert_statement(deltas: &[BucketDelta]) -> QueryBuilder<'_, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO price_history \
         (mint_address, bucket_time, open, high, low, close, volume, trade_count, buy_count, sell_count, market_cap) ",
    );
    builder.push_values(deltas, |mut row, delta| {
        row.push_bind(&delta.token_key)
            .push_bind(delta.bucket_start)
            .push_bind(delta.open)
            .push_bind(delta.high)
            .push_bind(delta.low)
            .push_bind(delta.close)
            .push_bind(delta.volume)
            .push_bind(delta.trade_count)
            .push_bind(delta.buy_count)
            .push_bind(delta.sell_count)
            .push_bind(delta.market_cap);
    });
    builder.push(UPSERT_SUFFIX);
    builder
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn upsert_buckets(&self, deltas: &[BucketDelta]) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in deltas.chunks(ROWS_PER_STATEMENT) {
            upsert_statement(chunk).build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("Upserted {} bucket rows", deltas.len());
        Ok(())
    }

    async fn get_ohlcv(
        &self,
        mint: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>> {
        let rows: Vec<PointRow> = sqlx::query_as(
            r#"
            SELECT
                EXTRACT(EPOCH FROM date_trunc($2, bucket_time))::BIGINT AS time,
                ((array_agg(open ORDER BY bucket_time ASC))[1])::FLOAT8 AS open,
                MAX(high)::FLOAT8 AS high,
                MIN(low)::FLOAT8 AS low,
                ((array_agg(close ORDER BY bucket_time DESC))[1])::FLOAT8 AS close,
                COALESCE(SUM(volume), 0)::FLOAT8 AS volume,
                ((array_agg(market_cap ORDER BY bucket_time DESC)
                    FILTER (WHERE market_cap IS NOT NULL))[1])::FLOAT8 AS market_cap
            FROM price_history
            WHERE mint_address = $1 AND bucket_time BETWEEN $3 AND $4
            GROUP BY 1
            ORDER BY 1 ASC
            "#,
        )
        .bind(mint)
        .bind(resolution.date_trunc_unit())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| OhlcvPoint {
                time: r.time,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: r.volume,
                market_cap: r.market_cap,
            })
            .collect())
    }

    async fn get_latest_price(&self, mint: &str) -> Result<Option<LatestPrice>> {
        let row: Option<LatestRow> = sqlx::query_as(
            r#"
            SELECT close::FLOAT8 AS close,
                   market_cap::FLOAT8 AS market_cap,
                   EXTRACT(EPOCH FROM bucket_time)::BIGINT AS time
            FROM price_history
            WHERE mint_address = $1
            ORDER BY bucket_time DESC
            LIMIT 1
            "#,
        )
        .bind(mint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LatestPrice {
            price: r.close,
            market_cap: r.market_cap,
            time: r.time,
        }))
    }

    async fn oracle_candidates(&self, exclude: &str) -> Result<Vec<String>> {
        let mints: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT mint_address
            FROM price_history
            WHERE mint_address <> $1
            GROUP BY mint_address
            HAVING SUM(volume) > 0
            ORDER BY mint_address
            "#,
        )
        .bind(exclude)
        .fetch_all(&self.pool)
        .await?;
        Ok(mints.into_iter().map(|(mint,)| mint).collect())
    }

    async fn load_token_meta(&self) -> Result<Vec<(String, TokenMeta)>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            "SELECT mint_address, decimals, total_supply::TEXT AS total_supply FROM tokens",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let decimals = match u8::try_from(row.decimals) {
                    Ok(d) => d,
                    Err(_) => {
                        warn!("Skipping token {} with invalid decimals {}", row.mint_address, row.decimals);
                        return None;
                    }
                };
                let total_supply = row.total_supply.as_deref().and_then(parse_supply);
                Some((row.mint_address, TokenMeta { decimals, total_supply }))
            })
            .collect())
    }
}

/// NUMERIC renders as text like `1000000000` or `1000000000.000`.
fn parse_supply(raw: &str) -> Option<u64> {
    let integral = raw.split('.').next()?;
    integral.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::ohlcv::fold_batch;
    use crate::types::{PriceSource, PriceUpdate};

    #[test]
    fn test_upsert_statement_is_single_multi_row_insert() {
        let deltas = fold_batch(&[
            PriceUpdate::new("A", 1.0, 0, PriceSource::Stream),
            PriceUpdate::new("B", 2.0, 0, PriceSource::Stream),
        ]);
        let builder = upsert_statement(&deltas);
        let sql = builder.sql().to_string();
        assert_eq!(sql.matches("INSERT INTO price_history").count(), 1);
        assert!(sql.contains("$22"));
        assert!(sql.contains("GREATEST(price_history.high, EXCLUDED.high)"));
        assert!(sql.contains("LEAST(price_history.low, EXCLUDED.low)"));
        // open is only written on insert
        assert!(!sql.contains("open ="));
    }

    #[test]
    fn test_parse_supply() {
        assert_eq!(parse_supply("1000000000"), Some(1_000_000_000));
        assert_eq!(parse_supply("42.000"), Some(42));
        assert_eq!(parse_supply("-1"), None);
    }
}
