//! Upstream account stream: one persistent websocket per network.

pub mod backoff;
pub mod connector;
pub mod envelope;

pub use backoff::{Backoff, NextDelay};
pub use connector::{
    ConnectorSettings, ConnectorStatus, RawAccountUpdate, ReconnectOutcome, StreamConnector, UpstreamSubscription,
};

use crate::config::Config;
use std::time::Duration;

impl ConnectorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            commitment: config.stream_commitment.clone(),
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect_base_delay_ms),
                Duration::from_millis(config.reconnect_max_delay_ms),
                config.reconnect_max_attempts,
                Duration::from_millis(config.reconnect_cooldown_ms),
            ),
            ping_interval: Duration::from_secs(config.stream_ping_interval_secs.max(1)),
            stale_after: Duration::from_secs(config.stream_stale_after_secs.max(1)),
        }
    }
}
