//! Fan-out behavior over real websocket connections.

use dex_price_aggregator::publisher::{serve, ChannelSink, FanoutPublisher, PricePublisher};
use dex_price_aggregator::types::{PriceSource, PriceUpdate};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> anyhow::Result<(String, Arc<FanoutPublisher>, CancellationToken)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let publisher = Arc::new(FanoutPublisher::new(Duration::from_secs(30)));
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(listener, publisher.clone(), 32, shutdown.clone()));
    Ok((url, publisher, shutdown))
}

async fn subscribed_client(url: &str, mint: &str) -> anyhow::Result<Client> {
    let (mut client, _) = connect_async(url).await?;
    client
        .send(Message::Text(format!(r#"{{"type":"subscribe","mintAddress":"{}"}}"#, mint)))
        .await?;
    Ok(client)
}

async fn wait_for_subscriptions(publisher: &FanoutPublisher, n: usize) -> anyhow::Result<()> {
    timeout(Duration::from_secs(5), async {
        while publisher.stats().subscriptions < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

async fn next_text(client: &mut Client) -> anyhow::Result<serde_json::Value> {
    loop {
        match timeout(Duration::from_secs(5), client.next()).await? {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(_)) => continue,
            other => anyhow::bail!("connection ended: {:?}", other),
        }
    }
}

/// A subscriber whose send fails is removed; the healthy ones still get the
/// frame.
#[tokio::test]
async fn test_failing_subscriber_does_not_block_others() -> anyhow::Result<()> {
    let (url, publisher, shutdown) = start().await?;

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(subscribed_client(&url, "MintA").await?);
    }
    wait_for_subscriptions(&publisher, 4).await?;

    // receiver dropped up front, so every send to it fails
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let broken = publisher.register(Arc::new(ChannelSink::new(tx)));
    publisher.subscribe(&broken, "MintA");
    assert_eq!(publisher.connection_count(), 5);

    let update = PriceUpdate::new("MintA", 0.042, 1_700_000_000_000, PriceSource::Stream);
    assert_eq!(publisher.publish_price(&update), 4);
    assert_eq!(publisher.connection_count(), 4);

    for client in clients.iter_mut() {
        let frame = next_text(client).await?;
        assert_eq!(frame["type"], "price");
        assert_eq!(frame["mintAddress"], "MintA");
        assert_eq!(frame["price"], 0.042);
    }

    shutdown.cancel();
    Ok(())
}

/// Subscribers only see the tokens they asked for, and unsubscribe stops
/// delivery.
#[tokio::test]
async fn test_delivery_follows_interest_sets() -> anyhow::Result<()> {
    let (url, publisher, shutdown) = start().await?;
    let mut a = subscribed_client(&url, "MintA").await?;
    let mut b = subscribed_client(&url, "MintB").await?;
    wait_for_subscriptions(&publisher, 2).await?;

    publisher.publish_price(&PriceUpdate::new("MintB", 2.0, 1, PriceSource::Poll));
    publisher.publish_price(&PriceUpdate::new("MintA", 1.0, 2, PriceSource::Poll));

    assert_eq!(next_text(&mut a).await?["mintAddress"], "MintA");
    assert_eq!(next_text(&mut b).await?["mintAddress"], "MintB");

    // respect the one-message-per-second inbound limit
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    a.send(Message::Text(r#"{"type":"unsubscribe","mintAddress":"MintA"}"#.into()))
        .await?;
    timeout(Duration::from_secs(5), async {
        while publisher.stats().subscriptions > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(publisher.publish_price(&PriceUpdate::new("MintA", 1.1, 3, PriceSource::Poll)), 0);

    shutdown.cancel();
    Ok(())
}

/// A peer that never reads or answers pings is swept, and the server closes
/// its socket instead of parking on the read half.
#[tokio::test]
async fn test_swept_silent_peer_socket_is_closed() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let publisher = Arc::new(FanoutPublisher::new(Duration::from_millis(100)));
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(listener, publisher.clone(), 32, shutdown.clone()));
    tokio::spawn(publisher.clone().run_sweeper(shutdown.clone()));

    let (mut silent, _) = connect_async(url.as_str()).await?;
    timeout(Duration::from_secs(5), async {
        while publisher.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    // no polling here, so the server's pings go unanswered
    timeout(Duration::from_secs(5), async {
        while publisher.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    let ended = timeout(Duration::from_secs(5), async {
        loop {
            match silent.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Text(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await?;
    assert!(ended);

    shutdown.cancel();
    Ok(())
}
