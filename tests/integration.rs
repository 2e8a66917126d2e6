//! End-to-end pipeline tests: connector channel into the dashboard loop and
//! out through the snapshot watch channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use trade_dashboard::analytics::{
    MaPoint, PriceBin, PricePoint, SessionStats, VolatilityStats, VolumeBySide,
};
use trade_dashboard::connector::{Connector, ConnectorConfig};
use trade_dashboard::dashboard::{Dashboard, DashboardConfig, DashboardSnapshot};
use trade_dashboard::error::Result;
use trade_dashboard::exchange::ExchangeAdapter;
use trade_dashboard::status::IngestMetrics;
use trade_dashboard::store::{init_store, AnalyticalStore, MockStore, StoreCapability};
use trade_dashboard::types::{now_ms, ExchangeId, Side, Trade};

fn trade(timestamp_ms: i64, price: f64) -> Trade {
    Trade::new(
        timestamp_ms,
        price,
        1.0,
        Side::Buy,
        ExchangeId::Coinbase,
        "BTC-USD".into(),
    )
    .expect("valid trade")
}

fn dashboard_config() -> DashboardConfig {
    DashboardConfig {
        pair: "BTC-USD".into(),
        timeframe_minutes: 5.0,
        aggregation_secs: None,
        buffer_capacity: 1000,
        refresh_interval: Duration::from_millis(20),
        flush_interval: Duration::from_millis(20),
    }
}

async fn wait_for_snapshot(
    rx: &mut watch::Receiver<DashboardSnapshot>,
    mut pred: impl FnMut(&DashboardSnapshot) -> bool,
) -> DashboardSnapshot {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            rx.changed().await.expect("dashboard alive");
            let snap = rx.borrow_and_update().clone();
            if pred(&snap) {
                return snap;
            }
        }
    })
    .await
    .expect("snapshot condition met in time")
}

#[tokio::test]
async fn trades_flow_from_channel_to_snapshot() {
    let metrics = Arc::new(IngestMetrics::register(&[ExchangeId::Coinbase]));
    let (snapshot_tx, mut snapshot_rx) = watch::channel(DashboardSnapshot::default());
    let (trade_tx, trade_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let dashboard = Dashboard::new(
        dashboard_config(),
        init_store(Duration::from_secs(8)).await,
        Duration::from_millis(500),
        metrics,
        snapshot_tx,
    );
    let handle = tokio::spawn(dashboard.run(trade_rx, cancel.clone()));

    let now = now_ms();
    for (i, p) in [100.0, 110.0, 90.0].iter().enumerate() {
        trade_tx.send(trade(now + i as i64, *p)).await.unwrap();
    }

    let snap = wait_for_snapshot(&mut snapshot_rx, |s| s.stats.trade_count == 3).await;
    assert_eq!(snap.stats.high, 110.0);
    assert_eq!(snap.stats.low, 90.0);
    assert_eq!(snap.stats.first, 100.0);
    assert_eq!(snap.stats.current, 90.0);
    assert_eq!(snap.stats.change_percent, -10.0);
    assert_eq!(snap.pair, "BTC-USD");
    assert_eq!(snap.moving_averages.len(), 3);
    assert_eq!(snap.moving_averages[0].ma_10, 100.0);
    let bin_total: u64 = snap.distribution.iter().map(|b| b.count).sum();
    assert_eq!(bin_total, 3);
    assert_eq!(snap.volume.buy_volume, 3.0);
    assert_eq!(snap.price_series.len(), 3);

    cancel.cancel();
    handle.await.unwrap();
}

/// Ingestion starts before the store/dashboard are up: trades sent into the
/// channel ahead of the dashboard loop are queued, not lost.
#[tokio::test]
async fn trades_queued_before_dashboard_start_are_ingested() {
    let (trade_tx, trade_rx) = mpsc::channel(64);
    let now = now_ms();
    for (i, p) in [100.0, 110.0, 90.0].iter().enumerate() {
        trade_tx.send(trade(now + i as i64, *p)).await.unwrap();
    }

    let metrics = Arc::new(IngestMetrics::register(&[]));
    let (snapshot_tx, mut snapshot_rx) = watch::channel(DashboardSnapshot::default());
    let cancel = CancellationToken::new();
    let dashboard = Dashboard::new(
        dashboard_config(),
        init_store(Duration::from_secs(8)).await,
        Duration::from_millis(500),
        metrics,
        snapshot_tx,
    );
    let handle = tokio::spawn(dashboard.run(trade_rx, cancel.clone()));

    let snap = wait_for_snapshot(&mut snapshot_rx, |s| s.stats.trade_count == 3).await;
    assert_eq!(snap.stats.change_percent, -10.0);
    assert_eq!(snap.ingested, 3);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn mock_store_still_yields_full_snapshots() {
    let metrics = Arc::new(IngestMetrics::register(&[]));
    let (snapshot_tx, mut snapshot_rx) = watch::channel(DashboardSnapshot::default());
    let (trade_tx, trade_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let dashboard = Dashboard::new(
        dashboard_config(),
        Arc::new(MockStore),
        Duration::from_millis(500),
        metrics,
        snapshot_tx,
    );
    let handle = tokio::spawn(dashboard.run(trade_rx, cancel.clone()));

    let now = now_ms();
    for i in 0..10 {
        trade_tx.send(trade(now + i, 100.0 + i as f64)).await.unwrap();
    }

    let snap = wait_for_snapshot(&mut snapshot_rx, |s| s.stats.trade_count == 10).await;
    assert!(!snap.store_active);
    assert_eq!(snap.stats.first, 100.0);
    assert_eq!(snap.stats.current, 109.0);
    assert_eq!(snap.stats.change_percent, 9.0);
    assert_eq!(snap.moving_averages.len(), 10);
    assert!(snap.volatility.volatility > 0.0);

    cancel.cancel();
    handle.await.unwrap();
}

/// Real-capability store whose every query hangs forever, so each metric
/// call exercises the query-timeout fallback.
struct StalledStore;

#[async_trait]
impl AnalyticalStore for StalledStore {
    fn capability(&self) -> StoreCapability {
        StoreCapability::Real
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, trades: &[Trade]) -> Result<usize> {
        Ok(trades.len())
    }

    async fn prune_to_capacity(&self, _keep: usize) -> Result<usize> {
        Ok(0)
    }

    async fn trade_count(&self) -> Result<u64> {
        Ok(0)
    }

    async fn session_stats(&self, _cutoff_ms: i64) -> Result<SessionStats> {
        std::future::pending().await
    }

    async fn volatility(&self, _cutoff_ms: i64) -> Result<VolatilityStats> {
        std::future::pending().await
    }

    async fn price_distribution(&self, _cutoff_ms: i64, _bins: usize) -> Result<Vec<PriceBin>> {
        std::future::pending().await
    }

    async fn moving_averages(&self, _cutoff_ms: i64) -> Result<Vec<MaPoint>> {
        std::future::pending().await
    }

    async fn volume_by_side(&self, _cutoff_ms: i64) -> Result<VolumeBySide> {
        std::future::pending().await
    }

    async fn price_series(
        &self,
        _cutoff_ms: i64,
        _aggregation_secs: Option<u32>,
    ) -> Result<Vec<PricePoint>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stalled_store_falls_back_to_buffer() {
    let metrics = Arc::new(IngestMetrics::register(&[]));
    let (snapshot_tx, mut snapshot_rx) = watch::channel(DashboardSnapshot::default());
    let (trade_tx, trade_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let dashboard = Dashboard::new(
        dashboard_config(),
        Arc::new(StalledStore),
        Duration::from_millis(25),
        metrics,
        snapshot_tx,
    );
    let handle = tokio::spawn(dashboard.run(trade_rx, cancel.clone()));

    let now = now_ms();
    for (i, p) in [100.0, 110.0, 90.0].iter().enumerate() {
        trade_tx.send(trade(now + i as i64, *p)).await.unwrap();
    }

    let snap = wait_for_snapshot(&mut snapshot_rx, |s| s.stats.trade_count == 3).await;
    assert_eq!(snap.stats.high, 110.0);
    assert_eq!(snap.stats.change_percent, -10.0);
    assert_eq!(snap.moving_averages.len(), 3);

    cancel.cancel();
    handle.await.unwrap();
}

/// Adapter whose endpoint is never reachable; drives the connector into
/// simulation mode quickly.
struct Unreachable;

impl ExchangeAdapter for Unreachable {
    fn id(&self) -> ExchangeId {
        ExchangeId::Coinbase
    }

    fn ws_url(&self, _pair: &str) -> String {
        // Port 1 refuses immediately on loopback.
        "ws://127.0.0.1:1/ws".to_string()
    }

    fn subscribe_message(&self, _pair: &str) -> Option<String> {
        None
    }

    fn normalize(&self, _raw: &str) -> Option<Trade> {
        None
    }
}

#[tokio::test]
async fn exhausted_connections_fall_back_to_simulation() {
    let metrics = Arc::new(IngestMetrics::register(&[ExchangeId::Coinbase]));
    let (trade_tx, mut trade_rx) = mpsc::channel(64);
    let cfg = ConnectorConfig {
        pair: "BTC-USD".into(),
        connect_timeout: Duration::from_secs(2),
        base_reconnect_delay: Duration::from_millis(2),
        max_reconnect_attempts: 2,
        sim_interval: Duration::from_millis(5),
        sim_jitter: Duration::from_millis(0),
        ..ConnectorConfig::default()
    };
    let connector = Connector::new(
        cfg,
        vec![Arc::new(Unreachable)],
        trade_tx,
        Arc::clone(&metrics),
    );
    connector.connect();

    let mut synthetic = Vec::new();
    for _ in 0..5 {
        let t = tokio::time::timeout(Duration::from_secs(30), trade_rx.recv())
            .await
            .expect("synthetic trade in time")
            .expect("channel open");
        synthetic.push(t);
    }

    assert!(metrics.connection_info().simulating);
    assert!(!metrics.connection_info().connected);
    for t in &synthetic {
        assert_eq!(t.exchange, ExchangeId::Simulation);
        assert!(t.price.is_finite() && t.price > 0.0);
        assert_eq!(t.pair, "BTC-USD");
    }

    connector.disconnect().await;
    assert!(!metrics.connection_info().simulating);
}

#[tokio::test]
async fn reconnect_after_disconnect_is_clean() {
    let metrics = Arc::new(IngestMetrics::register(&[ExchangeId::Coinbase]));
    let (trade_tx, mut trade_rx) = mpsc::channel(64);
    let cfg = ConnectorConfig {
        pair: "BTC-USD".into(),
        base_reconnect_delay: Duration::from_millis(2),
        max_reconnect_attempts: 1,
        sim_interval: Duration::from_millis(5),
        sim_jitter: Duration::from_millis(0),
        ..ConnectorConfig::default()
    };
    let connector = Connector::new(
        cfg,
        vec![Arc::new(Unreachable)],
        trade_tx,
        Arc::clone(&metrics),
    );

    connector.connect();
    let first = tokio::time::timeout(Duration::from_secs(30), trade_rx.recv())
        .await
        .expect("synthetic trade")
        .expect("channel open");
    assert_eq!(first.exchange, ExchangeId::Simulation);
    connector.disconnect().await;
    connector.disconnect().await; // idempotent

    // A fresh connect leaves simulation mode and runs the cycle again.
    connector.connect();
    let second = tokio::time::timeout(Duration::from_secs(30), trade_rx.recv())
        .await
        .expect("synthetic trade after reconnect")
        .expect("channel open");
    assert_eq!(second.exchange, ExchangeId::Simulation);
    connector.disconnect().await;
}
