use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::model::tick::Tick;

/// JSON-RPC 2.0 envelope used by the Lightstream realtime API, both for
/// outbound `subscribe` calls and inbound `channelMessage` notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpc2 {
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpc2 {
    pub fn subscribe(channel: &str, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: "subscribe".to_string(),
            params: serde_json::json!({ "channel": channel }),
            result: None,
            id: Some(id),
        }
    }
}

/// Ticker payload carried in `params.message` of a ticker channel
/// notification, and returned by `GET /v1/ticker`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerMessage {
    pub product_code: String,
    #[serde(default)]
    pub state: String,
    pub timestamp: String,
    #[serde(default)]
    pub tick_id: u64,
    pub best_bid: f64,
    pub best_ask: f64,
    #[serde(default)]
    pub best_bid_size: f64,
    #[serde(default)]
    pub best_ask_size: f64,
    #[serde(default)]
    pub total_bid_depth: f64,
    #[serde(default)]
    pub total_ask_depth: f64,
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub volume_by_product: f64,
}

impl TickerMessage {
    /// Convert into a domain tick with its timestamp normalized to `zone`.
    pub fn into_tick(self, zone: FixedOffset) -> Result<Tick, FeedError> {
        let timestamp = parse_feed_timestamp(&self.timestamp, zone)?;
        Ok(Tick {
            product_code: self.product_code,
            timestamp,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            best_bid_size: self.best_bid_size,
            best_ask_size: self.best_ask_size,
            volume: self.volume,
        })
    }
}

/// Parse a feed timestamp into `zone`.
///
/// The feed sends RFC3339 with a `Z` suffix; the REST API omits the offset,
/// in which case the value is UTC.
pub fn parse_feed_timestamp(
    raw: &str,
    zone: FixedOffset,
) -> Result<DateTime<FixedOffset>, FeedError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&zone));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().with_timezone(&zone))
        .map_err(|e| FeedError::Malformed(format!("timestamp '{}': {}", raw, e)))
}

/// Balance item (GET /v1/me/getbalance).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Balance {
    pub currency_code: String,
    pub amount: f64,
    pub available: f64,
}

/// Error body returned by the REST API on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct BitflyerApiErrorResponse {
    pub status: i64,
    pub error_message: String,
}
