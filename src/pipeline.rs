// src/pipeline.rs

use crate::aggregation::{AggregationQueue, QueueSettings};
use crate::config::Config;
use crate::decoder::{self, DecodedEvent};
use crate::error::{CalcError, PriceFeedError, Result};
use crate::oracle::{BatchPriceFetcher, FetcherSettings, OracleClient};
use crate::pricing::{PriceCalculator, QuoteUsdPrice, TokenRegistry};
use crate::publisher::{self, FanoutPublisher, PricePublisher};
use crate::store::{LatestPriceCache, PriceQueries, PriceStore};
use crate::stream::{ConnectorSettings, RawAccountUpdate, StreamConnector};
use crate::types::PriceUpdate;
use crate::utils::short_key;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Accepted(PriceUpdate),
    DecodeFailed,
    NotPriced,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub accepted: u64,
    pub decode_errors: u64,
    pub calc_errors: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    received: AtomicU64,
    accepted: AtomicU64,
    decode_errors: AtomicU64,
    calc_errors: AtomicU64,
    rejected: AtomicU64,
}

/// Stream side of the pipeline: decode, price, enqueue, publish.
pub struct DecodeWorker {
    calculator: Arc<PriceCalculator>,
    queue: Arc<AggregationQueue>,
    publisher: Arc<dyn PricePublisher>,
    counters: WorkerCounters,
}

impl DecodeWorker {
    pub fn new(calculator: Arc<PriceCalculator>, queue: Arc<AggregationQueue>, publisher: Arc<dyn PricePublisher>) -> Self {
        Self {
            calculator,
            queue,
            publisher,
            counters: WorkerCounters::default(),
        }
    }

    pub fn process(&self, raw: &RawAccountUpdate) -> ProcessOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let event = match decoder::decode(raw.kind, &raw.data) {
            Ok(event) => event,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[{}] Dropping {} account {} ({} bytes): {}",
                    raw.network,
                    raw.kind,
                    short_key(&raw.account),
                    raw.data.len(),
                    e
                );
                return ProcessOutcome::DecodeFailed;
            }
        };

        let update = match self.calculator.calculate(&raw.account, &event, raw.lamports, raw.received_at_ms) {
            Ok(update) => update,
            Err(CalcError::NotPriced) => {
                if !matches!(event, DecodedEvent::Unknown { .. }) {
                    debug!("No price yet for account {}", short_key(&raw.account));
                }
                return ProcessOutcome::NotPriced;
            }
            Err(e) => {
                self.counters.calc_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] Price calculation failed for {}: {}", raw.network, short_key(&raw.account), e);
                return ProcessOutcome::NotPriced;
            }
        };

        if !self.queue.enqueue(update.clone()) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return ProcessOutcome::Rejected;
        }
        self.publisher.publish_price(&update);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        ProcessOutcome::Accepted(update)
    }

    /// Processes updates until the connectors hang up or `shutdown` fires,
    /// pruning idle per-account state once per TTL.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<RawAccountUpdate>, shutdown: CancellationToken) {
        let mut prune = interval(self.calculator.coverage().ttl().max(Duration::from_secs(1)));
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        prune.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                raw = rx.recv() => match raw {
                    Some(raw) => {
                        self.process(&raw);
                    }
                    None => break,
                },
                _ = prune.tick() => {
                    let (accounts, mints) = self.calculator.prune_stale();
                    if accounts + mints > 0 {
                        debug!("Pruned {} idle accounts and {} stream-covered mints", accounts, mints);
                    }
                }
            }
        }
        let stats = self.stats();
        info!(
            "Decode worker stopped: {} received, {} accepted, {} decode errors, {} calc errors",
            stats.received, stats.accepted, stats.decode_errors, stats.calc_errors
        );
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            calc_errors: self.counters.calc_errors.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Every long-lived service, built once and started from `main`.
pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<dyn PriceStore>,
    cache: Option<Arc<dyn LatestPriceCache>>,
    pub tokens: Arc<TokenRegistry>,
    pub quote_usd: Arc<QuoteUsdPrice>,
    pub queue: Arc<AggregationQueue>,
    pub publisher: Arc<FanoutPublisher>,
    pub worker: Arc<DecodeWorker>,
    pub fetcher: Arc<BatchPriceFetcher>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn PriceStore>,
        cache: Option<Arc<dyn LatestPriceCache>>,
        oracle: Arc<dyn OracleClient>,
    ) -> Result<Self> {
        let tokens = Arc::new(TokenRegistry::new(config.default_token_decimals));
        let quote_usd = Arc::new(QuoteUsdPrice::new());
        let queue = Arc::new(AggregationQueue::new(
            store.clone(),
            cache.clone(),
            QueueSettings::from_config(&config),
        ));
        let publisher = Arc::new(FanoutPublisher::new(Duration::from_secs(
            config.fanout_sweep_interval_secs.max(1),
        )));
        let calculator = Arc::new(
            PriceCalculator::new(
                tokens.clone(),
                config.quote_mint_pubkey()?,
                config.quote_decimals,
                config.price_denomination,
                quote_usd.clone(),
            )
            .with_state_ttl(Duration::from_secs(config.stream_state_ttl_secs.max(1))),
        );
        let coverage = calculator.coverage();
        let worker = Arc::new(DecodeWorker::new(calculator, queue.clone(), publisher.clone()));
        let fetcher = Arc::new(
            BatchPriceFetcher::new(
                store.clone(),
                oracle,
                queue.clone(),
                publisher.clone(),
                tokens.clone(),
                quote_usd.clone(),
                FetcherSettings::from_config(&config),
            )
            .with_stream_coverage(coverage),
        );

        Ok(Self {
            config,
            store,
            cache,
            tokens,
            quote_usd,
            queue,
            publisher,
            worker,
            fetcher,
        })
    }

    /// Fills the token registry from the store. A failure leaves defaults in
    /// place.
    pub async fn load_tokens(&self) -> usize {
        match self.store.load_token_meta().await {
            Ok(entries) => {
                self.tokens.extend(entries);
                info!("Loaded metadata for {} tokens", self.tokens.len());
                self.tokens.len()
            }
            Err(e) => {
                warn!("Token metadata unavailable, using defaults: {}", e);
                0
            }
        }
    }

    /// History reads for external handlers.
    pub fn queries(&self) -> PriceQueries {
        PriceQueries::new(self.store.clone(), self.cache.clone())
    }

    /// Spawns every service. All of them stop when `shutdown` fires; the
    /// queue performs a final drain first.
    pub fn start(&self, listener: TcpListener, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let (tx, rx) = mpsc::channel(self.config.decode_channel_size.max(1));

        handles.push(tokio::spawn(self.worker.clone().run(rx, shutdown.clone())));

        let settings = ConnectorSettings::from_config(&self.config);
        for endpoint in &self.config.endpoints {
            let connector = Arc::new(StreamConnector::new(
                endpoint.network,
                endpoint.ws_url.clone(),
                self.config.programs.clone(),
                settings.clone(),
                tx.clone(),
            ));
            handles.push(tokio::spawn(connector.run(shutdown.clone())));
        }
        drop(tx);

        handles.push(tokio::spawn(self.queue.clone().run(shutdown.clone())));

        let fanout = self.publisher.clone();
        let buffer = self.config.fanout_outbound_buffer;
        let server_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = publisher::serve(listener, fanout, buffer, server_shutdown).await {
                log_task_error("fan-out server", &e);
            }
        }));
        handles.push(tokio::spawn(self.publisher.clone().run_sweeper(shutdown.clone())));
        handles.push(tokio::spawn(self.fetcher.clone().run(shutdown)));

        info!("🚀 Pipeline started with {} tasks", handles.len());
        handles
    }
}

fn log_task_error(task: &str, e: &PriceFeedError) {
    log::error!("{} exited with error: {} ({:?})", task, e, e.categorize());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceDenomination;
    use crate::decoder::{bonding_curve, BondingCurveState, ProgramKind};
    use crate::store::MemoryPriceStore;
    use crate::types::Network;
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PriceUpdate>>);

    impl PricePublisher for Recorder {
        fn publish_price(&self, update: &PriceUpdate) -> usize {
            self.0.lock().unwrap().push(update.clone());
            1
        }
    }

    fn worker() -> (DecodeWorker, Arc<AggregationQueue>, Arc<Recorder>) {
        let (worker, queue, recorder, _) = worker_with_calculator();
        (worker, queue, recorder)
    }

    fn worker_with_calculator() -> (DecodeWorker, Arc<AggregationQueue>, Arc<Recorder>, Arc<PriceCalculator>) {
        let quote = Pubkey::from_str("So11111111111111111111111111111111111111112").unwrap();
        let calculator = Arc::new(PriceCalculator::new(
            Arc::new(TokenRegistry::new(9)),
            quote,
            9,
            PriceDenomination::Quote,
            Arc::new(QuoteUsdPrice::new()),
        ));
        let queue = Arc::new(AggregationQueue::new(
            Arc::new(MemoryPriceStore::new()),
            None,
            QueueSettings::default(),
        ));
        let recorder = Arc::new(Recorder::default());
        (
            DecodeWorker::new(calculator.clone(), queue.clone(), recorder.clone()),
            queue,
            recorder,
            calculator,
        )
    }

    fn raw(kind: ProgramKind, data: Vec<u8>) -> RawAccountUpdate {
        RawAccountUpdate {
            network: Network::Devnet,
            kind,
            account: "CurveAccount111".to_string(),
            data,
            lamports: Some(0),
            slot: Some(1),
            received_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_curve_update_is_enqueued_and_published() {
        let (worker, queue, recorder) = worker();
        let state = BondingCurveState {
            discriminator: [1; 8],
            mint: Pubkey::new_unique(),
            virtual_reserve: 30_000_000_000,
            token_reserve: 1_000_000_000_000,
        };
        let outcome = worker.process(&raw(ProgramKind::BondingCurve, bonding_curve::encode(&state)));
        let ProcessOutcome::Accepted(update) = outcome else {
            panic!("expected accepted update, got {:?}", outcome);
        };
        assert_eq!(update.token_key, state.mint.to_string());
        assert!((update.price - 0.030030).abs() < 1e-6);
        assert_eq!(queue.len(), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert_eq!(worker.stats().accepted, 1);
    }

    #[test]
    fn test_streamed_mint_is_marked_covered() {
        let (worker, _, _, calculator) = worker_with_calculator();
        let state = BondingCurveState {
            discriminator: [1; 8],
            mint: Pubkey::new_unique(),
            virtual_reserve: 30_000_000_000,
            token_reserve: 1_000_000_000_000,
        };
        let coverage = calculator.coverage();
        assert!(!coverage.is_covered(&state.mint.to_string()));
        worker.process(&raw(ProgramKind::BondingCurve, bonding_curve::encode(&state)));
        assert!(coverage.is_covered(&state.mint.to_string()));
    }

    #[test]
    fn test_short_buffer_is_dropped_and_counted() {
        let (worker, queue, recorder) = worker();
        assert_eq!(worker.process(&raw(ProgramKind::BondingCurve, vec![0; 12])), ProcessOutcome::DecodeFailed);
        assert_eq!(worker.process(&raw(ProgramKind::Unknown, vec![0; 12])), ProcessOutcome::NotPriced);
        assert!(queue.is_empty());
        assert!(recorder.0.lock().unwrap().is_empty());
        let stats = worker.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.decode_errors, 1);
    }
}
