//! CLI configuration via clap.

use clap::Parser;

use crate::types::ExchangeId;

#[derive(Parser, Debug, Clone)]
#[command(name = "trade-dashboard")]
#[command(about = "Streams live trades from crypto exchanges and computes rolling dashboard analytics")]
pub struct Config {
    /// Trading pair (Coinbase product id; mapped per exchange)
    #[arg(short, long, default_value = "BTC-USD")]
    pub pair: String,

    /// Exchanges to connect to
    #[arg(short, long, value_delimiter = ',', default_values_t = [ExchangeId::Coinbase, ExchangeId::Binance])]
    pub exchanges: Vec<ExchangeId>,

    /// Skip live connections and start directly in simulation mode
    #[arg(long)]
    pub simulate: bool,

    /// Metrics window in minutes
    #[arg(short, long, default_value_t = 5.0)]
    pub timeframe_minutes: f64,

    /// Optional per-interval price aggregation in seconds (raw series if omitted)
    #[arg(long)]
    pub aggregation_secs: Option<u32>,

    /// Max trades kept in memory (and mirrored in the store)
    #[arg(long, default_value_t = 1000)]
    pub buffer_capacity: usize,

    /// Snapshot refresh interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub refresh_interval_ms: u64,

    /// Store flush interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub flush_interval_ms: u64,

    /// Analytical store bootstrap timeout in seconds (falls back to mock)
    #[arg(long, default_value_t = 8)]
    pub store_timeout_secs: u64,

    /// Per-query store timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub query_timeout_ms: u64,

    /// Status/metrics HTTP port
    #[arg(long, default_value_t = 9090)]
    pub status_port: u16,
}
