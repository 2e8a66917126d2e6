//! Core domain types for trade data.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Trade direction from the taker's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
            Side::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Coinbase,
    Binance,
    /// Synthetic random-walk generator, active when no live feed is available.
    #[value(skip)]
    Simulation,
}

impl ExchangeId {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeId::Coinbase => "coinbase",
            ExchangeId::Binance => "binance",
            ExchangeId::Simulation => "simulation",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical trade record, exchange-agnostic. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    /// Milliseconds since epoch — exchange-reported when available,
    /// otherwise ingestion time.
    pub timestamp_ms: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub exchange: ExchangeId,
    pub pair: String,
}

impl Trade {
    /// Construct a validated trade. Returns `None` when `price` is not a
    /// positive finite number or `size` is not a non-negative finite number —
    /// rejected records are dropped before buffering, never stored as NaN.
    #[must_use]
    pub fn new(
        timestamp_ms: i64,
        price: f64,
        size: f64,
        side: Side,
        exchange: ExchangeId,
        pair: String,
    ) -> Option<Self> {
        if !price.is_finite() || price <= 0.0 || !size.is_finite() || size < 0.0 {
            return None;
        }
        Some(Self {
            timestamp_ms,
            price,
            size,
            side,
            exchange,
            pair,
        })
    }
}

/// Connection status signal for UI indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// True when at least one live exchange connection is open.
    pub connected: bool,
    /// Exchanges currently connected.
    pub exchanges: Vec<&'static str>,
    /// True when the synthetic generator is the active data source.
    pub simulating: bool,
}

/// Current wall-clock time in milliseconds since epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
