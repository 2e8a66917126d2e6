//! Dashboard controller.
//!
//! A single task owns the trade buffer and the flush queue. It receives
//! normalized trades from the connector channel, mirrors them into the
//! analytical store in batches, and on every refresh tick publishes a
//! [`DashboardSnapshot`] through a watch channel. Rendering is a consumer
//! concern; whatever sits on the other end of the watch receiver sees the
//! latest complete snapshot and nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::{
    MaPoint, MetricsEngine, PriceBin, PricePoint, SessionStats, VolatilityStats, VolumeBySide,
    DEFAULT_BINS,
};
use crate::buffer::TradeBuffer;
use crate::error::Result;
use crate::status::IngestMetrics;
use crate::store::AnalyticalStore;
use crate::types::{now_ms, ConnectionInfo, Trade};

/// Store prune runs once every this many flushes.
const PRUNE_EVERY: u64 = 10;

/// One complete refresh of every dashboard panel. Cheap to clone; the watch
/// channel hands the same snapshot to any number of consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at_ms: i64,
    pub pair: String,
    pub connection: ConnectionInfo,
    pub stats: SessionStats,
    pub volatility: VolatilityStats,
    pub distribution: Vec<PriceBin>,
    pub moving_averages: Vec<MaPoint>,
    pub volume: VolumeBySide,
    pub price_series: Vec<PricePoint>,
    /// Trades currently buffered in memory.
    pub buffered: usize,
    /// Total trades received since startup, across evictions.
    pub ingested: u64,
    /// False when analytics are running on the buffer fallback.
    pub store_active: bool,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub pair: String,
    pub timeframe_minutes: f64,
    pub aggregation_secs: Option<u32>,
    pub buffer_capacity: usize,
    pub refresh_interval: Duration,
    pub flush_interval: Duration,
}

pub struct Dashboard {
    cfg: DashboardConfig,
    engine: MetricsEngine,
    store: Arc<dyn AnalyticalStore>,
    metrics: Arc<IngestMetrics>,
    snapshot_tx: watch::Sender<DashboardSnapshot>,
}

impl Dashboard {
    #[must_use]
    pub fn new(
        cfg: DashboardConfig,
        store: Arc<dyn AnalyticalStore>,
        query_timeout: Duration,
        metrics: Arc<IngestMetrics>,
        snapshot_tx: watch::Sender<DashboardSnapshot>,
    ) -> Self {
        Self {
            cfg,
            engine: MetricsEngine::new(Arc::clone(&store), query_timeout)
                .with_degraded_flag(Arc::clone(&metrics.store_degraded)),
            store,
            metrics,
            snapshot_tx,
        }
    }

    /// Drive the buffer, flush, and refresh loops until cancellation or the
    /// trade channel closes with nothing left to publish.
    pub async fn run(self, mut trade_rx: mpsc::Receiver<Trade>, cancel: CancellationToken) {
        let mut buffer = TradeBuffer::new(self.cfg.buffer_capacity);
        let mut pending: Vec<Trade> = Vec::new();
        let flush_busy = Arc::new(AtomicBool::new(false));
        let mut flushes: u64 = 0;
        let mut ingested: u64 = 0;
        let mut ingest_open = true;

        if !self.store.capability().is_real() {
            self.metrics.store_degraded.store(true, Ordering::Relaxed);
        }

        let mut flush_tick = tokio::time::interval(self.cfg.flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh_tick = tokio::time::interval(self.cfg.refresh_interval);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            pair = %self.cfg.pair,
            capacity = self.cfg.buffer_capacity,
            "dashboard loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = trade_rx.recv(), if ingest_open => match maybe {
                    Some(trade) => {
                        ingested += 1;
                        buffer.push(trade.clone());
                        pending.push(trade);
                    }
                    None => {
                        ingest_open = false;
                        debug!("trade channel closed");
                    }
                },
                _ = flush_tick.tick() => {
                    self.flush(&mut pending, &flush_busy, &mut flushes);
                }
                _ = refresh_tick.tick() => {
                    match self.build_snapshot(&buffer, ingested).await {
                        Ok(snapshot) => {
                            // send_replace never fails; a snapshot with no
                            // receivers is simply the latest value waiting.
                            self.snapshot_tx.send_replace(snapshot);
                        }
                        Err(e) => warn!(error = %e, "snapshot build failed"),
                    }
                }
            }
        }

        // Final flush so a clean shutdown leaves the store current.
        self.flush(&mut pending, &flush_busy, &mut flushes);
        info!("dashboard loop stopped");
    }

    /// Hand the pending batch to a background insert. Skipped while a prior
    /// flush is still in flight; the batch keeps accumulating and goes out
    /// on the next tick.
    fn flush(&self, pending: &mut Vec<Trade>, busy: &Arc<AtomicBool>, flushes: &mut u64) {
        if pending.is_empty() {
            return;
        }
        if !self.store.capability().is_real() {
            pending.clear();
            return;
        }
        if busy.swap(true, Ordering::AcqRel) {
            debug!(pending = pending.len(), "flush in flight, deferring batch");
            return;
        }

        let batch = std::mem::take(pending);
        *flushes += 1;
        let prune = *flushes % PRUNE_EVERY == 0;
        let keep = self.cfg.buffer_capacity;
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let busy = Arc::clone(busy);

        tokio::spawn(async move {
            match store.insert_batch(&batch).await {
                Ok(inserted) => debug!(inserted, "flushed trades to store"),
                Err(e) => {
                    warn!(error = %e, dropped = batch.len(), "store flush failed");
                    metrics.store_degraded.store(true, Ordering::Relaxed);
                }
            }
            if prune {
                if let Err(e) = store.prune_to_capacity(keep).await {
                    warn!(error = %e, "store prune failed");
                }
            }
            busy.store(false, Ordering::Release);
        });
    }

    async fn build_snapshot(&self, buffer: &TradeBuffer, ingested: u64) -> Result<DashboardSnapshot> {
        let tf = self.cfg.timeframe_minutes;
        let stats = self.engine.session_stats(buffer, tf).await?;
        let volatility = self.engine.volatility(buffer, tf).await?;
        let distribution = self.engine.price_distribution(buffer, tf, DEFAULT_BINS).await?;
        let moving_averages = self.engine.moving_averages(buffer, tf).await?;
        let volume = self.engine.volume_by_side(buffer, tf).await?;
        let price_series = self
            .engine
            .price_series(buffer, tf, self.cfg.aggregation_secs)
            .await?;

        Ok(DashboardSnapshot {
            generated_at_ms: now_ms(),
            pair: self.cfg.pair.clone(),
            connection: self.metrics.connection_info(),
            stats,
            volatility,
            distribution,
            moving_averages,
            volume,
            price_series,
            buffered: buffer.len(),
            ingested,
            store_active: self.engine.store_capability().is_real()
                && !self.metrics.store_degraded.load(Ordering::Relaxed),
        })
    }
}
