//! Stream connector: owns the live exchange connections.
//!
//! One task per configured exchange runs a connect/read/reconnect loop and
//! feeds accepted trades into a single mpsc channel. Reconnects are linear
//! (`base_delay * attempt`) with a little jitter, capped at a maximum number
//! of attempts. Once every configured exchange has exhausted its attempts
//! with no connection open, the connector enters simulation mode and emits
//! synthetic random-walk trades so the rest of the pipeline stays live.
//! A fresh `connect()` after `disconnect()` leaves simulation mode.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exchange::ExchangeAdapter;
use crate::status::{ExchangeStatus, IngestMetrics};
use crate::types::{now_ms, ConnectionInfo, ExchangeId, Side, Trade};

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub pair: String,
    pub connect_timeout: Duration,
    /// Reconnect delay grows linearly: `base_reconnect_delay * attempt`.
    pub base_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Mean interval between synthetic trades.
    pub sim_interval: Duration,
    /// Uniform jitter applied to the synthetic interval.
    pub sim_jitter: Duration,
    pub sim_floor: f64,
    pub sim_ceiling: f64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            pair: "BTC-USD".to_string(),
            connect_timeout: Duration::from_secs(10),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            sim_interval: Duration::from_secs(1),
            sim_jitter: Duration::from_millis(250),
            sim_floor: 20_000.0,
            sim_ceiling: 50_000.0,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Maintains zero or more exchange connections and delivers accepted trades
/// to the ingestion channel. All delivery is via the channel; no error
/// propagates to callers synchronously.
pub struct Connector {
    cfg: ConnectorConfig,
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
    trade_tx: mpsc::Sender<Trade>,
    metrics: Arc<IngestMetrics>,
    running: Mutex<Option<Running>>,
}

impl Connector {
    #[must_use]
    pub fn new(
        cfg: ConnectorConfig,
        adapters: Vec<Arc<dyn ExchangeAdapter>>,
        trade_tx: mpsc::Sender<Trade>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            cfg,
            adapters,
            trade_tx,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Spawn the connection tasks. No-op if already running.
    pub fn connect(&self) {
        let mut running = self.running.lock().expect("connector state lock");
        if running.is_some() {
            debug!("connector already running");
            return;
        }
        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            self.cfg.clone(),
            self.adapters.clone(),
            self.trade_tx.clone(),
            self.metrics.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, supervisor });
    }

    /// Close all sockets and cancel all pending timers. Idempotent.
    pub async fn disconnect(&self) {
        let running = self.running.lock().expect("connector state lock").take();
        if let Some(Running { cancel, supervisor }) = running {
            cancel.cancel();
            let _ = supervisor.await;
            info!("connector disconnected");
        }
    }

    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        self.metrics.connection_info()
    }
}

/// Runs every exchange loop to completion, then falls back to the synthetic
/// generator if nothing is cancelled and nothing is left connected.
async fn supervise(
    cfg: ConnectorConfig,
    adapters: Vec<Arc<dyn ExchangeAdapter>>,
    trade_tx: mpsc::Sender<Trade>,
    metrics: Arc<IngestMetrics>,
    cancel: CancellationToken,
) {
    let handles: Vec<JoinHandle<()>> = adapters
        .into_iter()
        .map(|adapter| {
            let status = metrics.exchange(adapter.id());
            tokio::spawn(run_exchange(
                adapter,
                cfg.clone(),
                trade_tx.clone(),
                status,
                cancel.clone(),
            ))
        })
        .collect();

    for handle in handles {
        let _ = handle.await;
    }

    if cancel.is_cancelled() {
        return;
    }

    warn!("all live connections exhausted, entering simulation mode");
    run_simulation(&cfg, &trade_tx, &metrics, &cancel).await;
}

/// Connect/read/reconnect loop for one exchange. Returns when cancelled or
/// when reconnect attempts are exhausted.
async fn run_exchange(
    adapter: Arc<dyn ExchangeAdapter>,
    cfg: ConnectorConfig,
    trade_tx: mpsc::Sender<Trade>,
    status: Arc<ExchangeStatus>,
    cancel: CancellationToken,
) {
    let id = adapter.id();
    let url = adapter.ws_url(&cfg.pair);
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        info!(exchange = %id, %url, "connecting");

        match tokio::time::timeout(cfg.connect_timeout, connect_async(&url)).await {
            Err(_) => {
                status.errors.fetch_add(1, Relaxed);
                error!(exchange = %id, "connection timed out");
            }
            Ok(Err(e)) => {
                status.errors.fetch_add(1, Relaxed);
                error!(exchange = %id, error = %e, "connection failed");
            }
            Ok(Ok((ws_stream, _))) => {
                info!(exchange = %id, "connected");
                status.connected.store(true, Relaxed);

                let (mut write, mut read) = ws_stream.split();

                if let Some(sub) = adapter.subscribe_message(&cfg.pair) {
                    if let Err(e) = write.send(Message::Text(sub.into())).await {
                        status.errors.fetch_add(1, Relaxed);
                        status.connected.store(false, Relaxed);
                        error!(exchange = %id, error = %e, "subscribe failed");
                        continue;
                    }
                    info!(exchange = %id, pair = %cfg.pair, "subscribed");
                }

                let mut delivered = false;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(exchange = %id, "shutting down");
                            status.connected.store(false, Relaxed);
                            return;
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                status.messages.fetch_add(1, Relaxed);
                                delivered = true;
                                if let Some(trade) = adapter.normalize(text.as_str()) {
                                    status.trades.fetch_add(1, Relaxed);
                                    if trade_tx.send(trade).await.is_err() {
                                        // Ingestion side is gone; nothing left to do.
                                        status.connected.store(false, Relaxed);
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!(exchange = %id, "stream ended");
                                break;
                            }
                            Some(Ok(_)) => {} // Pong/Binary/Frame — ignore.
                            Some(Err(e)) => {
                                status.errors.fetch_add(1, Relaxed);
                                warn!(exchange = %id, error = %e, "ws error");
                                break;
                            }
                        }
                    }
                }

                status.connected.store(false, Relaxed);
                if delivered {
                    attempt = 0;
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        attempt += 1;
        if attempt >= cfg.max_reconnect_attempts {
            warn!(exchange = %id, attempts = attempt, "reconnect attempts exhausted");
            return;
        }

        status.reconnections.fetch_add(1, Relaxed);
        let base_ms = cfg.base_reconnect_delay.as_millis() as u64 * u64::from(attempt);
        let jitter = rand::random::<u64>() % (base_ms / 2).max(1);
        let delay = Duration::from_millis(base_ms + jitter);
        warn!(exchange = %id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Bounded random walk emitted on a jittered interval. Keeps the pipeline
/// exercised and demonstrable with no network access.
async fn run_simulation(
    cfg: &ConnectorConfig,
    trade_tx: &mpsc::Sender<Trade>,
    metrics: &IngestMetrics,
    cancel: &CancellationToken,
) {
    metrics.simulating.store(true, Relaxed);
    info!(
        floor = cfg.sim_floor,
        ceiling = cfg.sim_ceiling,
        "simulation mode active"
    );

    let mut price = (cfg.sim_floor + cfg.sim_ceiling) / 2.0;
    loop {
        let (trade, delay) = next_synthetic(cfg, &mut price);
        if trade_tx.send(trade).await.is_err() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    metrics.simulating.store(false, Relaxed);
    info!("simulation mode stopped");
}

/// One step of the walk: ±0.5% move clamped to the configured bounds, random
/// side, sub-unit size, and a jittered delay until the next emission.
fn next_synthetic(cfg: &ConnectorConfig, price: &mut f64) -> (Trade, Duration) {
    let mut rng = rand::rng();

    let step = (rng.random::<f64>() - 0.5) * *price * 0.01;
    *price = (*price + step).clamp(cfg.sim_floor, cfg.sim_ceiling);

    let trade = Trade {
        timestamp_ms: now_ms(),
        price: *price,
        size: rng.random::<f64>(),
        side: if rng.random::<bool>() { Side::Buy } else { Side::Sell },
        exchange: ExchangeId::Simulation,
        pair: cfg.pair.clone(),
    };

    let base_ms = cfg.sim_interval.as_millis() as i64;
    let jitter_ms = cfg.sim_jitter.as_millis() as i64;
    let offset = if jitter_ms > 0 {
        rng.random_range(-jitter_ms..=jitter_ms)
    } else {
        0
    };
    let delay = Duration::from_millis((base_ms + offset).max(1) as u64);

    (trade, delay)
}
