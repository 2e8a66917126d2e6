//! Coinbase Exchange `matches` channel adapter.
//!
//! Subscribes to the `matches` channel for the configured product and
//! normalizes `match`/`last_match` messages. Prices and sizes arrive as
//! decimal strings; the trade side is reported from the taker's perspective
//! and is taken as-is. Timestamps use the exchange-reported RFC-3339 `time`
//! field when present, falling back to ingestion time.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::types::{now_ms, ExchangeId, Side, Trade};

use super::ExchangeAdapter;

const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

pub struct Coinbase;

/// Envelope for every frame on the feed. Non-match messages (subscriptions,
/// heartbeats, errors) leave the trade fields unset and normalize to `None`.
#[derive(Deserialize)]
struct CoinbaseMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    price: Option<&'a str>,
    size: Option<&'a str>,
    side: Option<&'a str>,
    /// RFC-3339; parsed leniently so a malformed value costs only the
    /// exchange timestamp, not the trade.
    time: Option<&'a str>,
    product_id: Option<&'a str>,
}

impl ExchangeAdapter for Coinbase {
    fn id(&self) -> ExchangeId {
        ExchangeId::Coinbase
    }

    fn ws_url(&self, _pair: &str) -> String {
        COINBASE_WS_URL.to_string()
    }

    fn subscribe_message(&self, pair: &str) -> Option<String> {
        Some(
            json!({
                "type": "subscribe",
                "product_ids": [pair],
                "channels": ["matches"]
            })
            .to_string(),
        )
    }

    fn normalize(&self, raw: &str) -> Option<Trade> {
        let msg: CoinbaseMessage<'_> = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(exchange = "coinbase", error = %e, "unparseable frame");
                return None;
            }
        };

        if msg.kind != "match" && msg.kind != "last_match" {
            return None;
        }

        let price = msg.price?.parse::<f64>().ok()?;
        let size = msg.size?.parse::<f64>().ok()?;
        let side = match msg.side {
            Some("buy") => Side::Buy,
            Some("sell") => Side::Sell,
            _ => Side::Unknown,
        };
        let timestamp_ms = msg
            .time
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map_or_else(now_ms, |t| t.timestamp_millis());
        let pair = msg.product_id.unwrap_or("unknown").to_string();

        Trade::new(timestamp_ms, price, size, side, ExchangeId::Coinbase, pair)
    }
}
