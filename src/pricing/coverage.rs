// src/pricing/coverage.rs

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Mints the stream has priced recently. The oracle fetcher skips these so
/// polled prices never land in buckets fed by the stream.
#[derive(Debug)]
pub struct StreamCoverage {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl StreamCoverage {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    pub fn record(&self, mint: &str) {
        self.seen.insert(mint.to_string(), Instant::now());
    }

    /// True while the last stream price for `mint` is younger than the TTL.
    pub fn is_covered(&self, mint: &str) -> bool {
        self.seen
            .get(mint)
            .map(|at| at.elapsed() <= self.ttl)
            .unwrap_or(false)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Forgets mints the stream has not priced within the TTL.
    pub fn prune(&self) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, at| at.elapsed() <= self.ttl);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
