//! Shared helpers for unit tests.

use crate::types::{ExchangeId, Side, Trade};

/// Wire fixtures describing the same trade on both exchange formats.
pub const COINBASE_MATCH_JSON: &str = r#"{"type":"match","trade_id":1,"price":"100.5","size":"0.01","side":"buy","time":"2023-11-14T22:13:20.000000Z","product_id":"BTC-USD"}"#;

pub const BINANCE_TRADE_JSON: &str =
    r#"{"e":"trade","E":1700000000001,"s":"BTCUSDT","t":1,"p":"100.5","q":"0.01","m":false,"T":1700000000000}"#;

pub fn trade_at(timestamp_ms: i64, price: f64) -> Trade {
    trade_with_side(timestamp_ms, price, 1.0, Side::Buy)
}

pub fn trade_with_side(timestamp_ms: i64, price: f64, size: f64, side: Side) -> Trade {
    Trade::new(
        timestamp_ms,
        price,
        size,
        side,
        ExchangeId::Coinbase,
        "BTC-USD".into(),
    )
    .expect("valid test trade")
}
