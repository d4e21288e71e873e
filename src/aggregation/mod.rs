pub mod ohlcv;
pub mod queue;

pub use ohlcv::{fold_batch, BucketDelta};
pub use queue::{AggregationQueue, FlushOutcome, OverflowPolicy, QueueMetrics, QueueSettings};

use crate::config::Config;
use std::time::Duration;

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.queue_batch_size,
            flush_interval: Duration::from_millis(config.queue_flush_interval_ms.max(1)),
            max_retries: config.queue_max_retries,
            capacity: config.queue_capacity,
            overflow: config.queue_overflow_policy,
        }
    }
}
