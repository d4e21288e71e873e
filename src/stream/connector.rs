// src/stream/connector.rs

use crate::config::TrackedProgram;
use crate::decoder::ProgramKind;
use crate::error::{PriceFeedError, Result};
use crate::stream::backoff::{Backoff, NextDelay};
use crate::stream::envelope::{self, Envelope};
use crate::types::Network;
use crate::utils::now_ms;
use futures_util::{stream::StreamExt, SinkExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An account payload handed from the connector to the decode stage.
#[derive(Debug, Clone)]
pub struct RawAccountUpdate {
    pub network: Network,
    pub kind: ProgramKind,
    pub account: String,
    pub data: Vec<u8>,
    pub lamports: Option<u64>,
    pub slot: Option<u64>,
    pub received_at_ms: i64,
}

/// One `programSubscribe` issued on the current socket.
#[derive(Debug, Clone)]
pub struct UpstreamSubscription {
    pub correlation_id: u64,
    pub address: String,
    pub kind: ProgramKind,
    pub subscription_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    pub network: Network,
    pub connected: bool,
    pub reconnecting: bool,
    pub backoff_attempts: u32,
    pub connect_attempts: u64,
    pub messages_received: u64,
    pub subscriptions_acknowledged: usize,
}

#[derive(Debug)]
pub enum ReconnectOutcome {
    Connected(WsStream),
    /// Another caller already owns the reconnect loop; nothing was opened.
    AlreadyInProgress,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Stale,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub commitment: String,
    pub backoff: Backoff,
    pub ping_interval: Duration,
    pub stale_after: Duration,
}

/// Owns the persistent upstream socket for one network.
pub struct StreamConnector {
    network: Network,
    endpoint: String,
    programs: Vec<TrackedProgram>,
    settings: ConnectorSettings,
    sink: mpsc::Sender<RawAccountUpdate>,
    backoff: Mutex<Backoff>,
    subscriptions: Mutex<Vec<UpstreamSubscription>>,
    next_correlation_id: AtomicU64,
    is_reconnecting: AtomicBool,
    connected: AtomicBool,
    connect_attempts: AtomicU64,
    messages_received: AtomicU64,
}

/// Clears the reconnect flag even if the reconnect future is dropped mid-sleep.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl StreamConnector {
    pub fn new(
        network: Network,
        endpoint: String,
        programs: Vec<TrackedProgram>,
        settings: ConnectorSettings,
        sink: mpsc::Sender<RawAccountUpdate>,
    ) -> Self {
        let backoff = Mutex::new(settings.backoff.clone());
        Self {
            network,
            endpoint,
            programs,
            settings,
            sink,
            backoff,
            subscriptions: Mutex::new(Vec::new()),
            next_correlation_id: AtomicU64::new(1),
            is_reconnecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Opens the socket and issues one subscribe per tracked program.
    pub async fn connect(&self) -> Result<WsStream> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!("[{}] Connecting to upstream stream", self.network);

        let (mut ws, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| PriceFeedError::WebSocketError(format!("[{}] failed to connect: {}", self.network, e)))?;

        let mut fresh = Vec::with_capacity(self.programs.len());
        for program in &self.programs {
            let id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
            let request = envelope::subscribe_request(id, &program.address, &self.settings.commitment);
            ws.send(Message::Text(request)).await?;
            fresh.push(UpstreamSubscription {
                correlation_id: id,
                address: program.address.clone(),
                kind: program.kind,
                subscription_id: None,
            });
        }
        let count = fresh.len();
        *self.lock_subscriptions() = fresh;

        self.connected.store(true, Ordering::SeqCst);
        info!("[{}] Connected, {} subscribe requests sent", self.network, count);
        Ok(ws)
    }

    /// Runs the capped-backoff reconnect loop. Overlapping calls return
    /// [`ReconnectOutcome::AlreadyInProgress`] without opening a socket.
    pub async fn reconnect(&self, shutdown: &CancellationToken) -> ReconnectOutcome {
        if self.is_reconnecting.swap(true, Ordering::SeqCst) {
            debug!("[{}] Reconnect already in progress", self.network);
            return ReconnectOutcome::AlreadyInProgress;
        }
        let _guard = ReconnectGuard(&self.is_reconnecting);
        self.connected.store(false, Ordering::SeqCst);

        loop {
            let next = self.lock_backoff().next_delay();
            let wait = match next {
                NextDelay::Retry(delay) => {
                    info!("[{}] Reconnecting in {:?} (attempt {})", self.network, delay, self.lock_backoff().attempts());
                    delay
                }
                NextDelay::Exhausted { cooldown } => {
                    error!(
                        "[{}] Reconnect attempts exhausted, cooling down for {:?} before a new cycle",
                        self.network, cooldown
                    );
                    self.lock_backoff().reset();
                    cooldown
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => return ReconnectOutcome::Stopped,
                _ = sleep(wait) => {}
            }

            match self.connect().await {
                Ok(ws) => {
                    self.lock_backoff().reset();
                    return ReconnectOutcome::Connected(ws);
                }
                Err(e) => warn!("[{}] Reconnect attempt failed: {}", self.network, e),
            }
        }
    }

    /// Drives the connector until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut session = match self.connect().await {
            Ok(ws) => Some(ws),
            Err(e) => {
                warn!("[{}] Initial connect failed: {}", self.network, e);
                None
            }
        };

        loop {
            let ws = match session.take() {
                Some(ws) => ws,
                None => match self.reconnect(&shutdown).await {
                    ReconnectOutcome::Connected(ws) => ws,
                    ReconnectOutcome::Stopped => break,
                    ReconnectOutcome::AlreadyInProgress => {
                        // run() is the only reconnect caller in production
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = sleep(self.settings.ping_interval) => continue,
                        }
                    }
                },
            };

            match self.drive(ws, &shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Stale => warn!("[{}] No upstream traffic for {:?}, reconnecting", self.network, self.settings.stale_after),
                SessionEnd::Closed => warn!("[{}] Upstream session closed, reconnecting", self.network),
            }
            self.connected.store(false, Ordering::SeqCst);
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("[{}] Stream connector stopped", self.network);
    }

    async fn drive(&self, ws: WsStream, shutdown: &CancellationToken) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut ping = interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = ping.tick() => {
                    if last_inbound.elapsed() > self.settings.stale_after {
                        return SessionEnd::Stale;
                    }
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        warn!("[{}] Ping failed: {}", self.network, e);
                        return SessionEnd::Closed;
                    }
                }
                frame = read.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("[{}] Socket error: {}", self.network, e);
                            return SessionEnd::Closed;
                        }
                        None => return SessionEnd::Closed,
                    };
                    last_inbound = Instant::now();
                    match msg {
                        Message::Text(text) => {
                            if !self.handle_text(&text).await {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            info!("[{}] Upstream sent close: {:?}", self.network, frame);
                            return SessionEnd::Closed;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Returns false once the decode stage has gone away.
    async fn handle_text(&self, text: &str) -> bool {
        let envelope = match envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("[{}] Dropping unparseable frame: {}", self.network, e);
                return true;
            }
        };

        match envelope {
            Envelope::SubscribeAck { id, subscription } => {
                let mut subs = self.lock_subscriptions();
                if let Some(sub) = subs.iter_mut().find(|s| s.correlation_id == id) {
                    sub.subscription_id = Some(subscription);
                    debug!("[{}] Subscription {} confirmed for {}", self.network, subscription, sub.address);
                }
                true
            }
            Envelope::AccountNotification(notification) => {
                self.messages_received.fetch_add(1, Ordering::Relaxed);
                let target = self
                    .lock_subscriptions()
                    .iter()
                    .find(|s| s.subscription_id == Some(notification.subscription))
                    .map(|s| (s.address.clone(), s.kind));
                let Some((address, kind)) = target else {
                    debug!("[{}] Notification for unknown subscription {}", self.network, notification.subscription);
                    return true;
                };

                let update = RawAccountUpdate {
                    network: self.network,
                    kind,
                    account: notification.pubkey.unwrap_or(address),
                    data: notification.data,
                    lamports: notification.lamports,
                    slot: notification.slot,
                    received_at_ms: now_ms(),
                };
                if self.sink.send(update).await.is_err() {
                    warn!("[{}] Decode stage closed, stopping connector", self.network);
                    return false;
                }
                true
            }
            Envelope::Ignored => true,
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        ConnectorStatus {
            network: self.network,
            connected: self.connected.load(Ordering::SeqCst),
            reconnecting: self.is_reconnecting.load(Ordering::SeqCst),
            backoff_attempts: self.lock_backoff().attempts(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            subscriptions_acknowledged: self
                .lock_subscriptions()
                .iter()
                .filter(|s| s.subscription_id.is_some())
                .count(),
        }
    }

    fn lock_backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<UpstreamSubscription>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
