// src/oracle/fetcher.rs

use super::client::OracleClient;
use crate::aggregation::AggregationQueue;
use crate::config::{Config, PriceDenomination};
use crate::pricing::{market_cap, QuoteUsdPrice, StreamCoverage, TokenRegistry};
use crate::publisher::PricePublisher;
use crate::store::PriceStore;
use crate::types::{PriceSource, PriceUpdate};
use crate::utils::{now_ms, short_key};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub interval: Duration,
    pub batch_size: usize,
    pub rate_limit_per_min: u32,
    pub request_timeout: Duration,
    pub quote_mint: String,
    pub denomination: PriceDenomination,
}

impl FetcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.oracle_interval_secs.max(1)),
            batch_size: config.oracle_batch_size.max(1),
            rate_limit_per_min: config.oracle_rate_limit_per_min.max(1),
            request_timeout: Duration::from_secs(config.oracle_timeout_secs.max(1)),
            quote_mint: config.quote_mint.clone(),
            denomination: config.price_denomination,
        }
    }

    /// Minimum spacing between two oracle requests.
    pub fn request_gap(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.rate_limit_per_min.max(1)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    /// Skipped because the stream priced them recently.
    pub streamed: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub priced: usize,
    pub missing: usize,
}

/// Keeps consecutive requests at least `gap` apart.
struct Pacer {
    gap: Duration,
    next: Option<Instant>,
}

impl Pacer {
    fn new(gap: Duration) -> Self {
        Self { gap, next: None }
    }

    async fn wait(&mut self) {
        if let Some(next) = self.next {
            sleep_until(next).await;
        }
        self.next = Some(Instant::now() + self.gap);
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodically prices tokens with recorded volume that the stream does not
/// cover, and feeds the results into the aggregation queue and fan-out.
pub struct BatchPriceFetcher {
    store: Arc<dyn PriceStore>,
    client: Arc<dyn OracleClient>,
    queue: Arc<AggregationQueue>,
    publisher: Arc<dyn PricePublisher>,
    tokens: Arc<TokenRegistry>,
    quote_usd: Arc<QuoteUsdPrice>,
    coverage: Option<Arc<StreamCoverage>>,
    settings: FetcherSettings,
    in_flight: AtomicBool,
}

impl BatchPriceFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PriceStore>,
        client: Arc<dyn OracleClient>,
        queue: Arc<AggregationQueue>,
        publisher: Arc<dyn PricePublisher>,
        tokens: Arc<TokenRegistry>,
        quote_usd: Arc<QuoteUsdPrice>,
        settings: FetcherSettings,
    ) -> Self {
        Self {
            store,
            client,
            queue,
            publisher,
            tokens,
            quote_usd,
            coverage: None,
            settings,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Skips mints the stream has priced within the coverage TTL.
    pub fn with_stream_coverage(mut self, coverage: Arc<StreamCoverage>) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs one full pricing pass. Returns `None` when another pass is still
    /// in flight.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Oracle cycle still running, skipping tick");
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let started = Instant::now();
        let mut pacer = Pacer::new(self.settings.request_gap());
        let mut report = CycleReport::default();

        self.refresh_quote_price(&mut pacer).await;

        let mut candidates = match self.store.oracle_candidates(&self.settings.quote_mint).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Could not load oracle candidates: {} ({:?})", e, e.categorize());
                return Some(report);
            }
        };
        if let Some(coverage) = &self.coverage {
            let before = candidates.len();
            candidates.retain(|mint| !coverage.is_covered(mint));
            report.streamed = before - candidates.len();
        }
        report.candidates = candidates.len();

        for batch in candidates.chunks(self.settings.batch_size) {
            pacer.wait().await;
            report.batches += 1;
            let Some(prices) = self.fetch_batch(batch).await else {
                report.failed_batches += 1;
                continue;
            };
            for mint in batch {
                match prices.get(mint) {
                    Some(&usd) => {
                        if self.accept(mint, usd) {
                            report.priced += 1;
                        }
                    }
                    None => {
                        report.missing += 1;
                        debug!("No oracle price for {}", short_key(mint));
                    }
                }
            }
        }

        info!(
            "💱 Oracle cycle: {} candidates ({} stream-priced skipped), {} batches ({} failed), {} priced, {} missing in {:?}",
            report.candidates,
            report.streamed,
            report.batches,
            report.failed_batches,
            report.priced,
            report.missing,
            started.elapsed()
        );
        Some(report)
    }

    async fn fetch_batch(&self, ids: &[String]) -> Option<HashMap<String, f64>> {
        match timeout(self.settings.request_timeout, self.client.fetch_prices(ids)).await {
            Ok(Ok(prices)) => Some(prices),
            Ok(Err(e)) => {
                warn!("Oracle batch of {} failed: {}", ids.len(), e);
                None
            }
            Err(_) => {
                warn!(
                    "Oracle batch of {} timed out after {:?}, retrying next cycle",
                    ids.len(),
                    self.settings.request_timeout
                );
                None
            }
        }
    }

    async fn refresh_quote_price(&self, pacer: &mut Pacer) {
        pacer.wait().await;
        let ids = [self.settings.quote_mint.clone()];
        let Some(prices) = self.fetch_batch(&ids).await else {
            return;
        };
        match prices.get(&self.settings.quote_mint) {
            Some(&price) => {
                if self.quote_usd.update(price) {
                    debug!("Quote USD price now {}", price);
                }
            }
            None => warn!("Oracle returned no price for quote mint {}", short_key(&self.settings.quote_mint)),
        }
    }

    /// Converts an oracle USD price into the stored denomination, then
    /// enqueues and publishes it.
    fn accept(&self, mint: &str, usd: f64) -> bool {
        let price = match self.settings.denomination {
            PriceDenomination::Usd => usd,
            PriceDenomination::Quote => match self.quote_usd.get() {
                Some(quote) => usd / quote,
                None => {
                    debug!("Quote USD price unknown, cannot denominate {}", short_key(mint));
                    return false;
                }
            },
        };
        let meta = self.tokens.get(mint);
        let update = PriceUpdate::new(mint, price, now_ms(), PriceSource::Poll)
            .with_market_cap(market_cap(price, meta.total_supply, meta.decimals));
        if !self.queue.enqueue(update.clone()) {
            return false;
        }
        self.publisher.publish_price(&update);
        true
    }

    /// Starts a cycle every interval until `shutdown`. A tick that lands while
    /// the previous cycle is still running is a no-op.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Oracle fetcher every {:?}, batches of {}, {} req/min",
            self.settings.interval, self.settings.batch_size, self.settings.rate_limit_per_min
        );
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let this = self.clone();
                    let cycle_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cycle_shutdown.cancelled() => {}
                            report = this.run_cycle() => {
                                if let Some(report) = report {
                                    if report.candidates > 0 && report.failed_batches == report.batches {
                                        error!("Every oracle batch failed this cycle");
                                    }
                                }
                            }
                        }
                    });
                }
            }
        }
        info!("Oracle fetcher stopped");
    }
}
