//! Ingest status: per-exchange counters/gauges, Prometheus text exposition,
//! and the `/health` endpoint.
//!
//! Plain atomics rendered by hand — no external metrics crate. The same
//! registry backs the [`ConnectionInfo`] status signal consumed by the
//! dashboard snapshot.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::{ConnectionInfo, ExchangeId};

/// Counters and connection gauge for a single exchange feed.
pub struct ExchangeStatus {
    pub name: &'static str,
    /// Text frames received (trade or not).
    pub messages: AtomicU64,
    /// Frames that normalized into an accepted trade.
    pub trades: AtomicU64,
    /// Connection-level and protocol errors.
    pub errors: AtomicU64,
    pub reconnections: AtomicU64,
    pub connected: AtomicBool,
}

impl ExchangeStatus {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            messages: AtomicU64::new(0),
            trades: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }
}

/// Registry of ingest status. Adding an exchange is a one-line change at the
/// registration site.
pub struct IngestMetrics {
    exchanges: Vec<Arc<ExchangeStatus>>,
    pub simulating: AtomicBool,
    /// Shared handle: the metrics engine holds a clone so analytics stop
    /// preferring a store known to have lost data.
    pub store_degraded: Arc<AtomicBool>,
    start_time: Instant,
}

impl IngestMetrics {
    #[must_use]
    pub fn register(ids: &[ExchangeId]) -> Self {
        Self {
            exchanges: ids
                .iter()
                .map(|id| Arc::new(ExchangeStatus::new(id.as_str())))
                .collect(),
            simulating: AtomicBool::new(false),
            store_degraded: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    /// Status handle for one exchange. Panics only on a programming error
    /// (asking for an exchange that was never registered).
    #[must_use]
    pub fn exchange(&self, id: ExchangeId) -> Arc<ExchangeStatus> {
        self.exchanges
            .iter()
            .find(|e| e.name == id.as_str())
            .cloned()
            .unwrap_or_else(|| panic!("exchange {id} not registered"))
    }

    /// Point-in-time connection status signal.
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        let exchanges: Vec<&'static str> = self
            .exchanges
            .iter()
            .filter(|e| e.connected.load(Relaxed))
            .map(|e| e.name)
            .collect();
        ConnectionInfo {
            connected: !exchanges.is_empty(),
            exchanges,
            simulating: self.simulating.load(Relaxed),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        writeln!(out, "# HELP dashboard_messages_total WebSocket frames received").unwrap();
        writeln!(out, "# TYPE dashboard_messages_total counter").unwrap();
        for e in &self.exchanges {
            writeln!(out, "dashboard_messages_total{{exchange=\"{}\"}} {}", e.name, e.messages.load(Relaxed)).unwrap();
        }

        writeln!(out, "# HELP dashboard_trades_total Frames normalized into accepted trades").unwrap();
        writeln!(out, "# TYPE dashboard_trades_total counter").unwrap();
        for e in &self.exchanges {
            writeln!(out, "dashboard_trades_total{{exchange=\"{}\"}} {}", e.name, e.trades.load(Relaxed)).unwrap();
        }

        writeln!(out, "# HELP dashboard_errors_total Connection/protocol errors").unwrap();
        writeln!(out, "# TYPE dashboard_errors_total counter").unwrap();
        for e in &self.exchanges {
            writeln!(out, "dashboard_errors_total{{exchange=\"{}\"}} {}", e.name, e.errors.load(Relaxed)).unwrap();
        }

        writeln!(out, "# HELP dashboard_reconnects_total Reconnection attempts").unwrap();
        writeln!(out, "# TYPE dashboard_reconnects_total counter").unwrap();
        for e in &self.exchanges {
            writeln!(out, "dashboard_reconnects_total{{exchange=\"{}\"}} {}", e.name, e.reconnections.load(Relaxed)).unwrap();
        }

        writeln!(out, "# HELP dashboard_exchange_up Exchange connection status (1=connected)").unwrap();
        writeln!(out, "# TYPE dashboard_exchange_up gauge").unwrap();
        for e in &self.exchanges {
            writeln!(out, "dashboard_exchange_up{{exchange=\"{}\"}} {}", e.name, u8::from(e.connected.load(Relaxed))).unwrap();
        }

        writeln!(out, "# HELP dashboard_simulating Synthetic generator active (1=yes)").unwrap();
        writeln!(out, "# TYPE dashboard_simulating gauge").unwrap();
        writeln!(out, "dashboard_simulating {}", u8::from(self.simulating.load(Relaxed))).unwrap();

        writeln!(out, "# HELP dashboard_store_degraded Analytical store running as mock (1=yes)").unwrap();
        writeln!(out, "# TYPE dashboard_store_degraded gauge").unwrap();
        writeln!(out, "dashboard_store_degraded {}", u8::from(self.store_degraded.load(Relaxed))).unwrap();

        writeln!(out, "# HELP dashboard_uptime_seconds Seconds since process start").unwrap();
        writeln!(out, "# TYPE dashboard_uptime_seconds gauge").unwrap();
        writeln!(out, "dashboard_uptime_seconds {}", self.start_time.elapsed().as_secs()).unwrap();

        out
    }
}

/// Serve `/health` and `/metrics` on the given port until cancelled.
pub async fn serve_http(port: u16, metrics: Arc<IngestMetrics>, cancel: CancellationToken) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prom_metrics))
        .with_state(metrics);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(port, error = %e, "failed to bind status port");
            return;
        }
    };

    info!(port, "status HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .ok();
}

async fn health(State(m): State<Arc<IngestMetrics>>) -> (StatusCode, &'static str) {
    let info = m.connection_info();
    let degraded_store = m.store_degraded.load(Relaxed);
    if info.connected && !degraded_store {
        (StatusCode::OK, "OK\n")
    } else if info.connected || info.simulating {
        (StatusCode::OK, "DEGRADED\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN\n")
    }
}

async fn prom_metrics(State(m): State<Arc<IngestMetrics>>) -> String {
    m.to_prometheus()
}
