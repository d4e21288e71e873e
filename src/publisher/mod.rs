pub mod messages;
pub mod registry;
pub mod server;

pub use messages::{ClientMessage, OutboundMessage};
pub use registry::{
    ChannelSink, ConnectionId, FanoutPublisher, InboundOutcome, Outbound, PublisherStats, SubscriberSink,
};
pub use server::serve;

use crate::types::PriceUpdate;

/// Destination for freshly computed prices.
pub trait PricePublisher: Send + Sync {
    /// Returns the number of subscribers reached.
    fn publish_price(&self, update: &PriceUpdate) -> usize;
}

impl PricePublisher for FanoutPublisher {
    fn publish_price(&self, update: &PriceUpdate) -> usize {
        let traded = update.volume > 0.0;
        let volume = traded.then_some(update.volume);
        let reached = self.broadcast_price(
            &update.token_key,
            update.price,
            volume,
            update.side,
            update.timestamp_ms,
        );
        if let (true, Some(side)) = (traded, update.side) {
            self.broadcast_trade(&update.token_key, update.price, update.volume, side, update.timestamp_ms);
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceSource, TradeSide};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_price_emits_trade_for_sided_volume() {
        let publisher = FanoutPublisher::new(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::channel(8);
        let id = publisher.register(std::sync::Arc::new(ChannelSink::new(tx)));
        publisher.subscribe(&id, "MintA");

        let quiet = PriceUpdate::new("MintA", 1.0, 1_000, PriceSource::Poll);
        assert_eq!(publisher.publish_price(&quiet), 1);
        let traded = PriceUpdate::new("MintA", 1.1, 2_000, PriceSource::Stream)
            .with_volume(4.0, Some(TradeSide::Buy));
        assert_eq!(publisher.publish_price(&traded), 1);

        let mut kinds = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            kinds.push(value["type"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(kinds, vec!["price", "price", "trade"]);
    }
}
