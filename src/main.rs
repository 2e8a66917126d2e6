use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trade_dashboard::config::Config;
use trade_dashboard::connector::{Connector, ConnectorConfig};
use trade_dashboard::dashboard::{Dashboard, DashboardConfig, DashboardSnapshot};
use trade_dashboard::exchange::adapters_for;
use trade_dashboard::status::{serve_http, IngestMetrics};
use trade_dashboard::store::init_store;

/// Ingestion channel depth. A full channel backpressures the socket readers
/// until the dashboard loop catches up.
const TRADE_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::parse();
    info!(
        pair = %cfg.pair,
        exchanges = ?cfg.exchanges,
        simulate = cfg.simulate,
        "starting trade dashboard"
    );

    let metrics = Arc::new(IngestMetrics::register(&cfg.exchanges));
    let cancel = CancellationToken::new();

    let (trade_tx, trade_rx) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
    // --simulate skips live adapters entirely; with nothing to connect the
    // connector drops straight into the synthetic generator.
    let adapters = if cfg.simulate {
        Vec::new()
    } else {
        adapters_for(&cfg.exchanges)
    };
    let connector = Connector::new(
        ConnectorConfig {
            pair: cfg.pair.clone(),
            ..ConnectorConfig::default()
        },
        adapters,
        trade_tx,
        Arc::clone(&metrics),
    );
    // Connect before the store bootstrap resolves: trades queue in the
    // channel while the store comes up, so a slow bootstrap never costs
    // live data.
    connector.connect();

    let store = init_store(Duration::from_secs(cfg.store_timeout_secs)).await;

    let (snapshot_tx, mut snapshot_rx) = watch::channel(DashboardSnapshot::default());
    let dashboard = Dashboard::new(
        DashboardConfig {
            pair: cfg.pair.clone(),
            timeframe_minutes: cfg.timeframe_minutes,
            aggregation_secs: cfg.aggregation_secs,
            buffer_capacity: cfg.buffer_capacity,
            refresh_interval: Duration::from_millis(cfg.refresh_interval_ms),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
        },
        store,
        Duration::from_millis(cfg.query_timeout_ms),
        Arc::clone(&metrics),
        snapshot_tx,
    );
    let dashboard_handle = tokio::spawn(dashboard.run(trade_rx, cancel.clone()));

    let status_handle = tokio::spawn(serve_http(
        cfg.status_port,
        Arc::clone(&metrics),
        cancel.clone(),
    ));

    // Headless snapshot consumer: logs a one-line summary per refresh. A
    // chart frontend would hold this same watch receiver instead.
    let log_cancel = cancel.clone();
    let logger_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = log_cancel.cancelled() => break,
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snap = snapshot_rx.borrow_and_update().clone();
                    if snap.stats.trade_count == 0 {
                        continue;
                    }
                    info!(
                        price = snap.stats.current,
                        change_pct = format!("{:+.2}", snap.stats.change_percent),
                        volatility = format!("{:.4}", snap.volatility.volatility),
                        trades = snap.stats.trade_count,
                        buy_vol = format!("{:.4}", snap.volume.buy_volume),
                        sell_vol = format!("{:.4}", snap.volume.sell_volume),
                        connected = snap.connection.connected,
                        simulating = snap.connection.simulating,
                        "snapshot"
                    );
                }
            }
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    cancel.cancel();
    connector.disconnect().await;

    for (name, handle) in [
        ("dashboard", dashboard_handle),
        ("status", status_handle),
        ("logger", logger_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "task join failed");
        }
    }
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
