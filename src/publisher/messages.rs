use crate::types::TradeSide;
use serde::{Deserialize, Serialize};

/// Frames pushed to subscriber connections.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Price {
        #[serde(rename = "mintAddress")]
        mint_address: String,
        price: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<f64>,
        #[serde(rename = "isSell", skip_serializing_if = "Option::is_none")]
        is_sell: Option<bool>,
        timestamp: i64,
    },
    Trade {
        #[serde(rename = "mintAddress")]
        mint_address: String,
        price: f64,
        amount: f64,
        side: TradeSide,
        timestamp: i64,
    },
}

/// Control frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "mintAddress")]
        mint_address: String,
    },
    Unsubscribe {
        #[serde(rename = "mintAddress")]
        mint_address: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_price_frame_omits_absent_fields() {
        let msg = OutboundMessage::Price {
            mint_address: "Mint".into(),
            price: 0.25,
            volume: None,
            is_sell: None,
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "price", "mintAddress": "Mint", "price": 0.25, "timestamp": 1_700_000_000_000i64})
        );
    }

    #[test]
    fn test_price_frame_with_trade_info() {
        let msg = OutboundMessage::Price {
            mint_address: "Mint".into(),
            price: 1.0,
            volume: Some(2.5),
            is_sell: Some(true),
            timestamp: 5,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["volume"], 2.5);
        assert_eq!(value["isSell"], true);
    }

    #[test]
    fn test_trade_frame_shape() {
        let msg = OutboundMessage::Trade {
            mint_address: "Mint".into(),
            price: 1.0,
            amount: 3.0,
            side: TradeSide::Sell,
            timestamp: 5,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "trade");
        assert_eq!(value["side"], "sell");
    }

    #[test]
    fn test_parse_client_messages() {
        let sub: ClientMessage = serde_json::from_str(r#"{"type":"subscribe","mintAddress":"A"}"#).unwrap();
        assert_eq!(sub, ClientMessage::Subscribe { mint_address: "A".into() });
        let unsub: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe","mintAddress":"A"}"#).unwrap();
        assert_eq!(unsub, ClientMessage::Unsubscribe { mint_address: "A".into() });
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"chat","mintAddress":"A"}"#).is_err());
    }
}
