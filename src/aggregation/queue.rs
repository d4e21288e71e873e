// src/aggregation/queue.rs

use super::ohlcv::{fold_batch, BucketDelta};
use crate::error::PriceFeedError;
use crate::store::{LatestPriceCache, PriceStore};
use crate::types::{LatestPrice, PriceUpdate};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What to do with a new update when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    /// `None` keeps the buffer unbounded.
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(1_000),
            max_retries: 5,
            capacity: None,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub queue_length: usize,
    pub processed: u64,
    pub failed_batches: u64,
    pub retried: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub last_flush_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Persisted(usize),
    Requeued(usize),
    Dropped(usize),
}

#[derive(Debug, Clone)]
struct Pending {
    update: PriceUpdate,
    attempts: u32,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed_batches: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    last_flush_ms: AtomicU64,
}

/// Buffers price updates and persists them as bucket upserts from a single
/// drain loop.
pub struct AggregationQueue {
    buffer: Mutex<VecDeque<Pending>>,
    notify: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    store: Arc<dyn PriceStore>,
    cache: Option<Arc<dyn LatestPriceCache>>,
    settings: QueueSettings,
    counters: Counters,
}

impl AggregationQueue {
    pub fn new(
        store: Arc<dyn PriceStore>,
        cache: Option<Arc<dyn LatestPriceCache>>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            store,
            cache,
            settings,
            counters: Counters::default(),
        }
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<Pending>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an update without blocking. Returns false when the update was
    /// rejected or dropped by the overflow policy.
    pub fn enqueue(&self, update: PriceUpdate) -> bool {
        if !update.is_valid() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Rejecting invalid update for {}: price={}", update.token_key, update.price);
            return false;
        }

        let len = {
            let mut buffer = self.lock_buffer();
            if let Some(capacity) = self.settings.capacity {
                if buffer.len() >= capacity {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    match self.settings.overflow {
                        OverflowPolicy::DropNewest => {
                            warn!("Queue full ({}), dropping update for {}", capacity, update.token_key);
                            return false;
                        }
                        OverflowPolicy::DropOldest => {
                            if let Some(evicted) = buffer.pop_front() {
                                warn!("Queue full ({}), evicting oldest update for {}", capacity, evicted.update.token_key);
                            }
                        }
                    }
                }
            }
            buffer.push_back(Pending { update, attempts: 0 });
            buffer.len()
        };

        if len >= self.settings.batch_size {
            self.notify.notify_one();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.lock_buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists at most one batch. Only one flush runs at a time.
    pub async fn flush(&self) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<Pending> = {
            let mut buffer = self.lock_buffer();
            let take = buffer.len().min(self.settings.batch_size);
            buffer.drain(..take).collect()
        };
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let updates: Vec<PriceUpdate> = batch.iter().map(|p| p.update.clone()).collect();
        let deltas = fold_batch(&updates);
        let started = Instant::now();
        let result = self.store.upsert_buckets(&deltas).await;
        self.counters
            .last_flush_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match result {
            Ok(()) => {
                self.counters.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!("Persisted {} updates as {} bucket rows", batch.len(), deltas.len());
                self.refresh_latest(&deltas).await;
                FlushOutcome::Persisted(batch.len())
            }
            Err(e) if !e.is_recoverable() && deltas.len() > 1 => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.isolate_rejected(batch, deltas, e).await
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.handle_failure(batch, &deltas, e)
            }
        }
    }

    /// Re-writes a rejected batch one bucket row at a time, so only the rows
    /// the store refuses are dropped.
    async fn isolate_rejected(&self, batch: Vec<Pending>, deltas: Vec<BucketDelta>, err: PriceFeedError) -> FlushOutcome {
        warn!("Batch of {} bucket rows rejected ({}), writing rows one at a time", deltas.len(), err);
        let mut remaining = batch;
        let mut written = Vec::new();
        let (mut persisted, mut requeued, mut dropped) = (0, 0, 0);

        for delta in deltas {
            let (group, rest): (Vec<Pending>, Vec<Pending>) = remaining
                .into_iter()
                .partition(|p| p.update.token_key == delta.token_key && p.update.bucket_start() == delta.bucket_start);
            remaining = rest;

            match self.store.upsert_buckets(std::slice::from_ref(&delta)).await {
                Ok(()) => {
                    persisted += group.len();
                    written.push(delta);
                }
                Err(e) => match self.handle_failure(group, std::slice::from_ref(&delta), e) {
                    FlushOutcome::Requeued(n) => requeued += n,
                    FlushOutcome::Dropped(n) => dropped += n,
                    FlushOutcome::Persisted(_) | FlushOutcome::Empty => {}
                },
            }
        }

        self.counters.processed.fetch_add(persisted as u64, Ordering::Relaxed);
        self.refresh_latest(&written).await;
        if requeued > 0 {
            FlushOutcome::Requeued(requeued)
        } else if persisted > 0 {
            FlushOutcome::Persisted(persisted)
        } else {
            FlushOutcome::Dropped(dropped)
        }
    }

    fn handle_failure(&self, batch: Vec<Pending>, deltas: &[BucketDelta], err: PriceFeedError) -> FlushOutcome {
        let retryable = err.is_recoverable();
        let (retry, give_up): (Vec<Pending>, Vec<Pending>) = batch
            .into_iter()
            .map(|mut p| {
                p.attempts += 1;
                p
            })
            .partition(|p| retryable && p.attempts <= self.settings.max_retries);

        for delta in deltas {
            warn!(
                "Bucket write failed for {} @ {} ({:?}): {}",
                delta.token_key,
                delta.bucket_start.to_rfc3339(),
                err.categorize(),
                err
            );
        }

        if !give_up.is_empty() {
            self.counters.dropped.fetch_add(give_up.len() as u64, Ordering::Relaxed);
            let reason = if retryable { "retries exhausted" } else { "permanent error" };
            for pending in &give_up {
                error!(
                    "Dropping update for {} @ {} after {} attempt(s), {}: {}",
                    pending.update.token_key,
                    pending.update.bucket_start().to_rfc3339(),
                    pending.attempts,
                    reason,
                    err
                );
            }
        }

        if retry.is_empty() {
            return FlushOutcome::Dropped(give_up.len());
        }

        let requeued = retry.len();
        self.counters.retried.fetch_add(requeued as u64, Ordering::Relaxed);
        let mut buffer = self.lock_buffer();
        for pending in retry.into_iter().rev() {
            buffer.push_front(pending);
        }
        FlushOutcome::Requeued(requeued)
    }

    async fn refresh_latest(&self, deltas: &[BucketDelta]) {
        let Some(cache) = &self.cache else {
            return;
        };
        // deltas are sorted by (token, minute): the last per token is the newest
        let mut latest: Vec<&BucketDelta> = Vec::new();
        for delta in deltas {
            match latest.last_mut() {
                Some(last) if last.token_key == delta.token_key => *last = delta,
                _ => latest.push(delta),
            }
        }
        for delta in latest {
            // the upsert keeps the row's market cap when the delta has none
            let market_cap = match delta.market_cap {
                Some(cap) => Some(cap),
                None => self.stored_market_cap(&delta.token_key).await,
            };
            let value = LatestPrice {
                price: delta.close,
                market_cap,
                time: delta.bucket_start.timestamp(),
            };
            if let Err(e) = cache.set_latest(&delta.token_key, &value).await {
                warn!("Latest-price cache write failed for {}: {}", delta.token_key, e);
            }
        }
    }

    async fn stored_market_cap(&self, token: &str) -> Option<f64> {
        match self.store.get_latest_price(token).await {
            Ok(stored) => stored.and_then(|p| p.market_cap),
            Err(e) => {
                debug!("Stored market cap unavailable for {}: {}", token, e);
                None
            }
        }
    }

    /// Flushes batches until the buffer is empty or a flush fails.
    pub async fn drain(&self) -> usize {
        let mut persisted = 0;
        loop {
            match self.flush().await {
                FlushOutcome::Persisted(n) => persisted += n,
                FlushOutcome::Dropped(_) => continue,
                FlushOutcome::Empty | FlushOutcome::Requeued(_) => return persisted,
            }
        }
    }

    /// Drain loop: flushes on every interval tick and whenever a full batch
    /// is waiting. Performs a last drain on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Aggregation queue started (batch={}, flush every {:?})",
            self.settings.batch_size, self.settings.flush_interval
        );
        let mut ticker = interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.drain().await;
                }
                _ = self.notify.notified() => {
                    self.drain().await;
                }
            }
        }

        let flushed = self.drain().await;
        let left = self.len();
        if left > 0 {
            warn!("Aggregation queue stopped with {} unpersisted updates", left);
        }
        info!("Aggregation queue stopped ({} updates flushed on shutdown)", flushed);
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            queue_length: self.len(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            last_flush_ms: self.counters.last_flush_ms.load(Ordering::Relaxed),
        }
    }
}
