//! Real-time trade analytics pipeline.
//!
//! Ingests live trade streams from Coinbase and Binance, normalizes them into
//! canonical trade records, buffers them in a bounded ring, mirrors them into
//! an embedded SQL store, and computes the derived metrics (session stats,
//! volatility, price distribution, moving averages, volume by side) that a
//! dashboard renders. Chart rendering itself consumes the published
//! [`dashboard::DashboardSnapshot`] watch channel.

pub mod analytics;
pub mod buffer;
pub mod config;
pub mod connector;
pub mod dashboard;
pub mod error;
pub mod exchange;
pub mod status;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;
