// src/publisher/server.rs

use super::registry::{ChannelSink, ConnectionId, FanoutPublisher, Outbound};
use crate::error::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Upper bound on the closing handshake once a connection has been removed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Accepts subscriber connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    publisher: Arc<FanoutPublisher>,
    outbound_buffer: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("📡 Fan-out server listening on ws://{}", addr);
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Fan-out server stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let publisher = publisher.clone();
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, publisher, outbound_buffer, shutdown).await;
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    publisher: Arc<FanoutPublisher>,
    outbound_buffer: usize,
    shutdown: CancellationToken,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let (writer, mut reader) = ws.split();
    let (tx, rx) = mpsc::channel(outbound_buffer.max(1));
    let id = publisher.register(Arc::new(ChannelSink::new(tx)));
    let Some(closed) = publisher.closed_token(&id) else {
        return;
    };
    debug!("Subscriber {} connected from {}", id, peer);

    let writer_task = tokio::spawn(write_frames(writer, rx, closed.clone()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            // removed by a failed delivery or the liveness sweep
            _ = closed.cancelled() => break,
            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        publisher.handle_client_message(&id, &text);
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => publisher.record_pong(&id),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Read from {} failed: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    close(&publisher, &id);
    let _ = writer_task.await;
}

fn close(publisher: &FanoutPublisher, id: &ConnectionId) {
    if publisher.unregister(id) {
        debug!("Subscriber {} disconnected", id);
    }
}

/// Drains the connection's outbound queue onto the socket. Ends once the
/// registry drops the sink, a close frame is queued or `closed` fires. A peer
/// that stopped reading cannot hold the task past that point.
async fn write_frames(mut writer: WsWriter, mut rx: mpsc::Receiver<Outbound>, closed: CancellationToken) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let message = match frame {
            Some(Outbound::Text(text)) => Message::Text(text),
            Some(Outbound::Ping) => Message::Ping(Vec::new()),
            Some(Outbound::Close) | None => break,
        };
        let sent = tokio::select! {
            result = writer.send(message) => result.is_ok(),
            _ = closed.cancelled() => false,
        };
        if !sent {
            break;
        }
    }
    let _ = timeout(CLOSE_GRACE, writer.close()).await;
}
