//! Exchange adapters: one per wire protocol.
//!
//! Each adapter is a pure translation layer from an exchange's raw JSON
//! frames to the canonical [`Trade`] record. Connection management lives in
//! [`crate::connector`]; adapters only describe where to connect, what to
//! send on open, and how to read a frame.

pub mod binance;
pub mod coinbase;

use crate::types::{ExchangeId, Trade};

/// Trait implemented by each exchange adapter.
///
/// `normalize` must never panic or propagate errors past its boundary:
/// parse failures and non-trade frames (subscription acks, heartbeats)
/// both yield `None` and the frame is dropped.
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn id(&self) -> ExchangeId;

    /// WebSocket endpoint for the given trading pair.
    fn ws_url(&self, pair: &str) -> String;

    /// Subscription request to send once the socket opens, if the exchange
    /// requires one.
    fn subscribe_message(&self, pair: &str) -> Option<String>;

    /// Translate one raw text frame into a canonical trade, or `None` for
    /// anything that is not a valid trade message.
    fn normalize(&self, raw: &str) -> Option<Trade>;
}

/// Adapters for the requested exchanges.
#[must_use]
pub fn adapters_for(ids: &[ExchangeId]) -> Vec<std::sync::Arc<dyn ExchangeAdapter>> {
    ids.iter()
        .filter_map(|id| -> Option<std::sync::Arc<dyn ExchangeAdapter>> {
            match id {
                ExchangeId::Coinbase => Some(std::sync::Arc::new(coinbase::Coinbase)),
                ExchangeId::Binance => Some(std::sync::Arc::new(binance::Binance)),
                ExchangeId::Simulation => None,
            }
        })
        .collect()
}
