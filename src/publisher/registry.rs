// src/publisher/registry.rs

use super::messages::{ClientMessage, OutboundMessage};
use crate::error::{PriceFeedError, Result};
use crate::types::TradeSide;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Minimum spacing between two processed client messages on one connection.
pub const INBOUND_MIN_GAP: Duration = Duration::from_secs(1);

/// Non-blocking handle to one subscriber connection.
pub trait SubscriberSink: Send + Sync {
    fn send_text(&self, text: &str) -> Result<()>;
    fn ping(&self) -> Result<()>;
    fn close(&self);
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Sink backed by a bounded channel; a full buffer counts as a failed send.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    fn push(&self, frame: Outbound) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PriceFeedError::PublishError("outbound buffer full".to_string()),
            mpsc::error::TrySendError::Closed(_) => PriceFeedError::PublishError("connection closed".to_string()),
        })
    }
}

impl SubscriberSink for ChannelSink {
    fn send_text(&self, text: &str) -> Result<()> {
        self.push(Outbound::Text(text.to_string()))
    }

    fn ping(&self) -> Result<()> {
        self.push(Outbound::Ping)
    }

    fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

struct Subscriber {
    sink: Arc<dyn SubscriberSink>,
    /// Cancelled on removal so the socket task drops both halves.
    closed: CancellationToken,
    tokens: HashSet<String>,
    last_seen_alive: Instant,
    last_inbound: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Subscribed,
    Unsubscribed,
    /// Arrived within [`INBOUND_MIN_GAP`] of the previous processed message.
    RateLimited,
    Invalid,
    UnknownConnection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub per_connection: Vec<(ConnectionId, usize)>,
}

/// Owns the subscriber registry and delivers broadcasts to interested
/// connections.
pub struct FanoutPublisher {
    connections: DashMap<ConnectionId, Subscriber>,
    sweep_interval: Duration,
}

impl FanoutPublisher {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            sweep_interval,
        }
    }

    pub fn register(&self, sink: Arc<dyn SubscriberSink>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Subscriber {
                sink,
                closed: CancellationToken::new(),
                tokens: HashSet::new(),
                last_seen_alive: Instant::now(),
                last_inbound: None,
            },
        );
        debug!("Subscriber {} connected ({} total)", id, self.connections.len());
        id
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, subscriber)) => {
                subscriber.sink.close();
                subscriber.closed.cancel();
                debug!("Subscriber {} removed ({} left)", id, self.connections.len());
                true
            }
            None => false,
        }
    }

    /// Fires once the connection leaves the registry, whatever removed it.
    /// `None` when it is already gone.
    pub fn closed_token(&self, id: &ConnectionId) -> Option<CancellationToken> {
        self.connections.get(id).map(|s| s.closed.clone())
    }

    pub fn subscribe(&self, id: &ConnectionId, token: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(mut subscriber) => {
                subscriber.tokens.insert(token.to_string());
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, id: &ConnectionId, token: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(mut subscriber) => {
                subscriber.tokens.remove(token);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: &ConnectionId, token: &str) -> bool {
        self.connections
            .get(id)
            .map(|s| s.tokens.contains(token))
            .unwrap_or(false)
    }

    /// Applies a client control frame, at most one per connection per second.
    /// Excess frames are dropped without a reply.
    pub fn handle_client_message(&self, id: &ConnectionId, text: &str) -> InboundOutcome {
        {
            let Some(mut subscriber) = self.connections.get_mut(id) else {
                return InboundOutcome::UnknownConnection;
            };
            let now = Instant::now();
            subscriber.last_seen_alive = now;
            if let Some(previous) = subscriber.last_inbound {
                if now.duration_since(previous) < INBOUND_MIN_GAP {
                    return InboundOutcome::RateLimited;
                }
            }
            subscriber.last_inbound = Some(now);
        }

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { mint_address }) => {
                self.subscribe(id, &mint_address);
                InboundOutcome::Subscribed
            }
            Ok(ClientMessage::Unsubscribe { mint_address }) => {
                self.unsubscribe(id, &mint_address);
                InboundOutcome::Unsubscribed
            }
            Err(e) => {
                debug!("Ignoring client frame from {}: {}", id, e);
                InboundOutcome::Invalid
            }
        }
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(mut subscriber) = self.connections.get_mut(id) {
            subscriber.last_seen_alive = Instant::now();
        }
    }

    pub fn broadcast_price(&self, token: &str, price: f64, volume: Option<f64>, side: Option<TradeSide>, timestamp_ms: i64) -> usize {
        let message = OutboundMessage::Price {
            mint_address: token.to_string(),
            price,
            volume,
            is_sell: side.map(|s| s == TradeSide::Sell),
            timestamp: timestamp_ms,
        };
        self.deliver(token, &message)
    }

    pub fn broadcast_trade(&self, token: &str, price: f64, amount: f64, side: TradeSide, timestamp_ms: i64) -> usize {
        let message = OutboundMessage::Trade {
            mint_address: token.to_string(),
            price,
            amount,
            side,
            timestamp: timestamp_ms,
        };
        self.deliver(token, &message)
    }

    /// Sends one serialized frame to every connection interested in `token`.
    /// Connections whose send fails are torn down after the pass.
    fn deliver(&self, token: &str, message: &OutboundMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize broadcast for {}: {}", token, e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.connections.iter() {
            if !entry.tokens.contains(token) {
                continue;
            }
            match entry.sink.send_text(&text) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("Send to {} failed: {}", entry.key(), e);
                    failed.push(*entry.key());
                }
            }
        }

        for id in failed {
            warn!("Dropping subscriber {} after failed delivery", id);
            self.unregister(&id);
        }
        delivered
    }

    /// Pings every connection and removes those silent for two sweep
    /// intervals. Returns the number removed.
    pub fn sweep_liveness(&self) -> usize {
        let deadline = self.sweep_interval * 2;
        let now = Instant::now();
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            if now.duration_since(entry.last_seen_alive) > deadline {
                dead.push(*entry.key());
            } else if entry.sink.ping().is_err() {
                dead.push(*entry.key());
            }
        }
        let removed = dead.len();
        for id in dead {
            info!("Closing unresponsive subscriber {}", id);
            self.unregister(&id);
        }
        removed
    }

    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_liveness();
                    if removed > 0 {
                        info!("Liveness sweep removed {} subscriber(s)", removed);
                    }
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> PublisherStats {
        let per_connection: Vec<(ConnectionId, usize)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.tokens.len()))
            .collect();
        PublisherStats {
            connections: per_connection.len(),
            subscriptions: per_connection.iter().map(|(_, n)| n).sum(),
            per_connection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        pings: Mutex<usize>,
        closed: Mutex<bool>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }
        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl SubscriberSink for RecordingSink {
        fn send_text(&self, text: &str) -> Result<()> {
            if self.fail {
                return Err(PriceFeedError::PublishError("broken pipe".into()));
            }
            self.frames.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn ping(&self) -> Result<()> {
            *self.pings.lock().unwrap() += 1;
            Ok(())
        }
        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn publisher() -> FanoutPublisher {
        FanoutPublisher::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_broadcast_survives_failing_subscriber() {
        let publisher = publisher();
        let healthy: Vec<Arc<RecordingSink>> = (0..4).map(|_| Arc::new(RecordingSink::default())).collect();
        let broken = Arc::new(RecordingSink::failing());

        let broken_id = publisher.register(broken.clone());
        publisher.subscribe(&broken_id, "MintA");
        let broken_closed = publisher.closed_token(&broken_id).unwrap();
        for sink in &healthy {
            let id = publisher.register(sink.clone());
            publisher.subscribe(&id, "MintA");
        }

        let delivered = publisher.broadcast_price("MintA", 1.5, None, None, 10);
        assert_eq!(delivered, 4);
        for sink in &healthy {
            assert_eq!(sink.frames().len(), 1);
        }
        assert_eq!(publisher.connection_count(), 4);
        assert!(*broken.closed.lock().unwrap());
        assert!(broken_closed.is_cancelled());
    }

    #[tokio::test]
    async fn test_broadcast_filtered_by_token() {
        let publisher = publisher();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let a_id = publisher.register(a.clone());
        let b_id = publisher.register(b.clone());
        publisher.subscribe(&a_id, "MintA");
        publisher.subscribe(&b_id, "MintB");

        assert_eq!(publisher.broadcast_price("MintA", 2.0, Some(1.0), Some(TradeSide::Sell), 10), 1);
        let frame: serde_json::Value = serde_json::from_str(&a.frames()[0]).unwrap();
        assert_eq!(frame["mintAddress"], "MintA");
        assert_eq!(frame["isSell"], true);
        assert!(b.frames().is_empty());

        assert_eq!(publisher.broadcast_trade("MintB", 2.0, 5.0, TradeSide::Buy, 11), 1);
        assert_eq!(b.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_are_idempotent() {
        let publisher = publisher();
        let id = publisher.register(Arc::new(RecordingSink::default()));
        assert!(publisher.subscribe(&id, "MintA"));
        assert!(publisher.subscribe(&id, "MintA"));
        assert_eq!(publisher.stats().subscriptions, 1);
        assert!(publisher.unsubscribe(&id, "MintA"));
        assert!(publisher.unsubscribe(&id, "MintA"));
        assert!(!publisher.is_subscribed(&id, "MintA"));
        assert!(!publisher.subscribe(&Uuid::new_v4(), "MintA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_rate_limit_one_per_second() {
        let publisher = publisher();
        let id = publisher.register(Arc::new(RecordingSink::default()));
        let sub_a = r#"{"type":"subscribe","mintAddress":"A"}"#;
        let sub_b = r#"{"type":"subscribe","mintAddress":"B"}"#;

        assert_eq!(publisher.handle_client_message(&id, sub_a), InboundOutcome::Subscribed);
        assert_eq!(publisher.handle_client_message(&id, sub_b), InboundOutcome::RateLimited);
        assert!(!publisher.is_subscribed(&id, "B"));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(publisher.handle_client_message(&id, sub_b), InboundOutcome::Subscribed);
        assert!(publisher.is_subscribed(&id, "B"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(publisher.handle_client_message(&id, "garbage"), InboundOutcome::Invalid);
        assert_eq!(
            publisher.handle_client_message(&Uuid::new_v4(), sub_a),
            InboundOutcome::UnknownConnection
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_sweep_removes_silent_connections() {
        let publisher = publisher();
        let quiet = Arc::new(RecordingSink::default());
        let chatty = Arc::new(RecordingSink::default());
        let quiet_id = publisher.register(quiet.clone());
        let chatty_id = publisher.register(chatty.clone());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(publisher.sweep_liveness(), 0);
        assert_eq!(*quiet.pings.lock().unwrap(), 1);
        publisher.record_pong(&chatty_id);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(publisher.sweep_liveness(), 1);
        assert_eq!(publisher.connection_count(), 1);
        assert!(*quiet.closed.lock().unwrap());
        assert!(publisher.closed_token(&quiet_id).is_none());
        assert!(publisher.stats().per_connection.iter().any(|(id, _)| *id == chatty_id));
        assert!(!publisher.unregister(&quiet_id));
    }

    #[tokio::test]
    async fn test_channel_sink_full_buffer_is_a_failed_send() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);
        assert!(sink.send_text("one").is_ok());
        assert!(matches!(sink.send_text("two"), Err(PriceFeedError::PublishError(_))));
        assert_eq!(rx.recv().await, Some(Outbound::Text("one".into())));
    }
}
