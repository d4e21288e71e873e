//! JSON-RPC framing for the upstream account stream.

use crate::error::{PriceFeedError, Result};
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};

/// A parsed upstream text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// `{"id": <correlation>, "result": <subscription id>}`
    SubscribeAck { id: u64, subscription: u64 },
    /// `programNotification`, or the flat `accountNotification` shape.
    AccountNotification(AccountNotification),
    /// Anything else (errors, unsubscribe acks, other methods).
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountNotification {
    pub subscription: u64,
    pub slot: Option<u64>,
    /// The program-owned account that changed. Flat frames omit it.
    pub pubkey: Option<String>,
    pub owner: Option<String>,
    pub lamports: Option<u64>,
    pub data: Vec<u8>,
}

/// Subscribes to every account owned by `program`.
pub fn subscribe_request(id: u64, program: &str, commitment: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "programSubscribe",
        "params": [
            program,
            {
                "encoding": "base64",
                "commitment": commitment
            }
        ]
    })
    .to_string()
}

pub fn parse(text: &str) -> Result<Envelope> {
    let json: Value = serde_json::from_str(text)?;

    if json["method"] == "programNotification" || json["method"] == "accountNotification" {
        return parse_notification(&json["params"]).map(Envelope::AccountNotification);
    }

    if let (Some(id), Some(subscription)) = (json["id"].as_u64(), json["result"].as_u64()) {
        return Ok(Envelope::SubscribeAck { id, subscription });
    }

    Ok(Envelope::Ignored)
}

fn parse_notification(params: &Value) -> Result<AccountNotification> {
    let subscription = params["subscription"]
        .as_u64()
        .ok_or_else(|| PriceFeedError::ParseError("notification without subscription id".to_string()))?;
    let result = &params["result"];
    let slot = result["context"]["slot"].as_u64();
    let value = &result["value"];

    // Program-style frames nest the account under `value.account`.
    let account = if value["account"].is_object() { &value["account"] } else { value };

    let encoded = account["data"]
        .as_array()
        .and_then(|parts| parts.first())
        .and_then(Value::as_str)
        .ok_or_else(|| PriceFeedError::ParseError("account data missing or not base64 encoded".to_string()))?;
    let data = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| PriceFeedError::ParseError(format!("invalid base64 account data: {}", e)))?;

    Ok(AccountNotification {
        subscription,
        slot,
        pubkey: value["pubkey"].as_str().map(str::to_string),
        owner: account["owner"].as_str().map(str::to_string),
        lamports: account["lamports"].as_u64(),
        data,
    })
}
