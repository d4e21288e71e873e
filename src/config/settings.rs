use crate::aggregation::queue::OverflowPolicy;
use crate::decoder::ProgramKind;
use crate::error::PriceFeedError;
use crate::types::Network;
use solana_sdk::pubkey::Pubkey;
use std::env;
use std::str::FromStr;

/// Native SOL wrapped mint, the default quote asset.
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const DEFAULT_ORACLE_BASE_URL: &str = "https://api.jup.ag/price/v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceDenomination {
    Quote,
    Usd,
}

#[derive(Debug, Clone)]
pub struct NetworkEndpoint {
    pub network: Network,
    pub ws_url: String,
}

#[derive(Debug, Clone)]
pub struct TrackedProgram {
    pub address: String,
    pub kind: ProgramKind,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: Vec<NetworkEndpoint>,
    pub programs: Vec<TrackedProgram>,
    pub stream_commitment: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_cooldown_ms: u64,
    pub stream_ping_interval_secs: u64,
    pub stream_stale_after_secs: u64,
    pub decode_channel_size: usize,
    /// Idle time after which per-account reserves and stream coverage expire.
    pub stream_state_ttl_secs: u64,
    pub quote_mint: String,
    pub quote_decimals: u8,
    pub default_token_decimals: u8,
    pub price_denomination: PriceDenomination,
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: Option<String>,
    pub latest_price_ttl_secs: u64,
    pub queue_batch_size: usize,
    pub queue_flush_interval_ms: u64,
    pub queue_max_retries: u32,
    pub queue_capacity: Option<usize>,
    pub queue_overflow_policy: OverflowPolicy,
    pub fanout_bind_addr: String,
    pub fanout_sweep_interval_secs: u64,
    pub fanout_outbound_buffer: usize,
    pub oracle_base_url: String,
    pub oracle_rate_limit_per_min: u32,
    pub oracle_batch_size: usize,
    pub oracle_interval_secs: u64,
    pub oracle_timeout_secs: u64,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|s| {
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Self {
        let mut endpoints = Vec::new();
        if let Ok(url) = env::var("DEVNET_WS_URL") {
            endpoints.push(NetworkEndpoint { network: Network::Devnet, ws_url: url });
        }
        if let Ok(url) = env::var("MAINNET_WS_URL") {
            endpoints.push(NetworkEndpoint { network: Network::Mainnet, ws_url: url });
        }

        let mut programs: Vec<TrackedProgram> = env_list("BONDING_CURVE_PROGRAM_IDS")
            .into_iter()
            .map(|address| TrackedProgram { address, kind: ProgramKind::BondingCurve })
            .collect();
        programs.extend(
            env_list("AMM_POOL_PROGRAM_IDS")
                .into_iter()
                .map(|address| TrackedProgram { address, kind: ProgramKind::AmmPool }),
        );

        let price_denomination = match env::var("PRICE_DENOMINATION")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "usd" => PriceDenomination::Usd,
            _ => PriceDenomination::Quote,
        };

        let queue_overflow_policy = match env::var("QUEUE_OVERFLOW_POLICY")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "drop-newest" | "drop_newest" => OverflowPolicy::DropNewest,
            _ => OverflowPolicy::DropOldest,
        };

        Config {
            endpoints,
            programs,
            stream_commitment: env::var("STREAM_COMMITMENT").unwrap_or_else(|_| "confirmed".to_string()),
            reconnect_base_delay_ms: env_parse("RECONNECT_BASE_DELAY_MS", 1_000),
            reconnect_max_delay_ms: env_parse("RECONNECT_MAX_DELAY_MS", 30_000),
            reconnect_max_attempts: env_parse("RECONNECT_MAX_ATTEMPTS", 10),
            reconnect_cooldown_ms: env_parse("RECONNECT_COOLDOWN_MS", 30_000),
            stream_ping_interval_secs: env_parse("STREAM_PING_INTERVAL_SECS", 30),
            stream_stale_after_secs: env_parse("STREAM_STALE_AFTER_SECS", 120),
            decode_channel_size: env_parse("DECODE_CHANNEL_SIZE", 4_096),
            stream_state_ttl_secs: env_parse("STREAM_STATE_TTL_SECS", 900),
            quote_mint: env::var("QUOTE_MINT").unwrap_or_else(|_| WRAPPED_SOL_MINT.to_string()),
            quote_decimals: env_parse("QUOTE_DECIMALS", 9),
            default_token_decimals: env_parse("DEFAULT_TOKEN_DECIMALS", 6),
            price_denomination,
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 10),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            latest_price_ttl_secs: env_parse("LATEST_PRICE_TTL_SECS", 300),
            queue_batch_size: env_parse("QUEUE_BATCH_SIZE", 100),
            queue_flush_interval_ms: env_parse("QUEUE_FLUSH_INTERVAL_MS", 1_000),
            queue_max_retries: env_parse("QUEUE_MAX_RETRIES", 5),
            queue_capacity: env::var("QUEUE_CAPACITY").ok().and_then(|v| v.trim().parse().ok()),
            queue_overflow_policy,
            fanout_bind_addr: env::var("FANOUT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string()),
            fanout_sweep_interval_secs: env_parse("FANOUT_SWEEP_INTERVAL_SECS", 30),
            fanout_outbound_buffer: env_parse("FANOUT_OUTBOUND_BUFFER", 256),
            oracle_base_url: env::var("ORACLE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_ORACLE_BASE_URL.to_string()),
            oracle_rate_limit_per_min: env_parse("ORACLE_RATE_LIMIT_PER_MIN", 600),
            oracle_batch_size: env_parse("ORACLE_BATCH_SIZE", 100),
            oracle_interval_secs: env_parse("ORACLE_INTERVAL_SECS", 60),
            oracle_timeout_secs: env_parse("ORACLE_TIMEOUT_SECS", 10),
        }
    }

    pub fn validate(&self) -> Result<(), PriceFeedError> {
        if self.database_url.is_empty() {
            return Err(PriceFeedError::ConfigError("DATABASE_URL cannot be empty".to_string()));
        }
        if self.endpoints.is_empty() {
            return Err(PriceFeedError::ConfigError(
                "at least one of DEVNET_WS_URL / MAINNET_WS_URL must be set".to_string(),
            ));
        }
        for endpoint in &self.endpoints {
            let parsed = url::Url::parse(&endpoint.ws_url).map_err(|e| {
                PriceFeedError::ConfigError(format!("invalid {} websocket url: {}", endpoint.network, e))
            })?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(PriceFeedError::ConfigError(format!(
                    "{} websocket url must use ws:// or wss://",
                    endpoint.network
                )));
            }
        }
        if self.programs.is_empty() {
            return Err(PriceFeedError::ConfigError(
                "no program addresses configured (BONDING_CURVE_PROGRAM_IDS / AMM_POOL_PROGRAM_IDS)".to_string(),
            ));
        }
        self.quote_mint_pubkey()?;
        if self.oracle_rate_limit_per_min == 0 {
            return Err(PriceFeedError::ConfigError("ORACLE_RATE_LIMIT_PER_MIN must be > 0".to_string()));
        }
        if self.queue_batch_size == 0 || self.oracle_batch_size == 0 {
            return Err(PriceFeedError::ConfigError("batch sizes must be > 0".to_string()));
        }
        if self.reconnect_base_delay_ms == 0 || self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(PriceFeedError::ConfigError(
                "RECONNECT_MAX_DELAY_MS must be >= RECONNECT_BASE_DELAY_MS > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn quote_mint_pubkey(&self) -> Result<Pubkey, PriceFeedError> {
        Pubkey::from_str(&self.quote_mint)
            .map_err(|e| PriceFeedError::ConfigError(format!("invalid QUOTE_MINT {}: {}", self.quote_mint, e)))
    }

    pub fn log_settings(&self) {
        log::info!("Networks: {:?}", self.endpoints.iter().map(|e| e.network).collect::<Vec<_>>());
        log::info!("Tracked programs: {}", self.programs.len());
        log::info!(
            "Queue: batch={} flush={}ms retries={} capacity={:?}",
            self.queue_batch_size,
            self.queue_flush_interval_ms,
            self.queue_max_retries,
            self.queue_capacity
        );
        log::info!(
            "Oracle: {} limit={}/min batch={} every {}s",
            self.oracle_base_url,
            self.oracle_rate_limit_per_min,
            self.oracle_batch_size,
            self.oracle_interval_secs
        );
        log::info!("Fan-out listening on {}", self.fanout_bind_addr);
        // database_url and redis_url may carry credentials
    }
}
