//! Binance spot `@trade` stream adapter.
//!
//! The stream auto-subscribes via the URL, so no subscription message is
//! sent. Trade frames carry price (`p`) and quantity (`q`) as decimal
//! strings, the trade time (`T`) in epoch milliseconds, and the maker flag
//! (`m`). Side convention, applied once here: `m == true` means the buyer
//! was the maker, i.e. the taker sold into the bid — mapped to `sell`;
//! `m == false` is mapped to `buy`.

use serde::Deserialize;
use tracing::debug;

use crate::types::{now_ms, ExchangeId, Side, Trade};

use super::ExchangeAdapter;

pub struct Binance;

#[derive(Deserialize)]
struct BinanceTrade<'a> {
    /// Event type; `trade` for trade frames, absent on acks.
    #[serde(default)]
    e: Option<&'a str>,
    #[serde(default)]
    p: Option<&'a str>,
    #[serde(default)]
    q: Option<&'a str>,
    #[serde(default)]
    m: Option<bool>,
    /// Trade time, epoch milliseconds.
    #[serde(rename = "T", default)]
    trade_time: Option<i64>,
    /// Stream symbol, e.g. `BTCUSDT`.
    #[serde(default)]
    s: Option<&'a str>,
}

/// `BTC-USD` → `btcusdt`: Binance spot quotes against USDT and lowercases
/// the concatenated symbol in stream names.
fn stream_symbol(pair: &str) -> String {
    let mut symbol: String = pair
        .chars()
        .filter(|c| *c != '-' && *c != '/')
        .collect::<String>()
        .to_lowercase();
    if symbol.ends_with("usd") {
        symbol.push('t');
    }
    symbol
}

impl ExchangeAdapter for Binance {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn ws_url(&self, pair: &str) -> String {
        format!("wss://stream.binance.com:9443/ws/{}@trade", stream_symbol(pair))
    }

    fn subscribe_message(&self, _pair: &str) -> Option<String> {
        None
    }

    fn normalize(&self, raw: &str) -> Option<Trade> {
        let msg: BinanceTrade<'_> = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(exchange = "binance", error = %e, "unparseable frame");
                return None;
            }
        };

        if msg.e != Some("trade") {
            return None;
        }

        let price = msg.p?.parse::<f64>().ok()?;
        let size = msg.q?.parse::<f64>().ok()?;
        let side = match msg.m {
            Some(true) => Side::Sell,
            Some(false) => Side::Buy,
            None => Side::Unknown,
        };
        let timestamp_ms = msg.trade_time.unwrap_or_else(now_ms);
        let pair = msg.s.unwrap_or("unknown").to_string();

        Trade::new(timestamp_ms, price, size, side, ExchangeId::Binance, pair)
    }
}
