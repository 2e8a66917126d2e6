//! Derived-metric computation.
//!
//! Every metric has two implementations: a SQL aggregation in the analytical
//! store (preferred) and a pure in-memory computation over the trade buffer
//! (always available). [`MetricsEngine`] picks the path per call: store
//! queries run under a timeout and any failure falls back to the buffer, so
//! the dashboard keeps producing numbers with zero dependencies beyond the
//! buffer itself.
//!
//! Statistical conventions, fixed once for both paths: population standard
//! deviation for volatility; half-open histogram bins `[start, end)` with a
//! closed top edge on the last bin; trailing moving-average windows that
//! shorten near the start of the series so every trade gets a value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::buffer::TradeBuffer;
use crate::error::{Error, Result};
use crate::store::{AnalyticalStore, StoreCapability};
use crate::types::{now_ms, Side, Trade};

/// Moving-average periods, in trades.
pub const MA_PERIODS: [usize; 3] = [10, 20, 50];

/// Default histogram bin count.
pub const DEFAULT_BINS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub high: f64,
    pub low: f64,
    pub first: f64,
    pub current: f64,
    pub change_percent: f64,
    pub trade_count: u64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolatilityStats {
    /// Population standard deviation of successive percent changes.
    pub volatility: f64,
    /// Mean absolute percent change.
    pub avg_change: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceBin {
    pub bin_start: f64,
    pub bin_end: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaPoint {
    pub timestamp_ms: i64,
    pub price: f64,
    pub ma_10: f64,
    pub ma_20: f64,
    pub ma_50: f64,
}

/// Volume totals per taker side. Trades with an unknown side are excluded
/// from both buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolumeBySide {
    pub buy_volume: f64,
    pub sell_volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

// ---------------------------------------------------------------------------
// Buffer-path computations (pure)
// ---------------------------------------------------------------------------

#[must_use]
pub fn session_stats(trades: &[Trade]) -> SessionStats {
    let Some(first_trade) = trades.first() else {
        return SessionStats::default();
    };
    let last = &trades[trades.len() - 1];

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut sum = 0.0;
    for t in trades {
        high = high.max(t.price);
        low = low.min(t.price);
        sum += t.price;
    }

    let first = first_trade.price;
    let current = last.price;
    let change_percent = if trades.len() < 2 || first == 0.0 {
        0.0
    } else {
        (current - first) / first * 100.0
    };

    SessionStats {
        high,
        low,
        first,
        current,
        change_percent,
        trade_count: trades.len() as u64,
        avg_price: sum / trades.len() as f64,
    }
}

#[must_use]
pub fn volatility(trades: &[Trade]) -> VolatilityStats {
    if trades.len() < 2 {
        return VolatilityStats::default();
    }

    let changes: Vec<f64> = trades
        .windows(2)
        .filter(|w| w[0].price != 0.0)
        .map(|w| (w[1].price - w[0].price) / w[0].price * 100.0)
        .collect();
    if changes.is_empty() {
        return VolatilityStats::default();
    }

    let n = changes.len() as f64;
    let mean = changes.iter().sum::<f64>() / n;
    let variance = changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    let avg_change = changes.iter().map(|c| c.abs()).sum::<f64>() / n;

    VolatilityStats {
        volatility: variance.sqrt(),
        avg_change,
    }
}

#[must_use]
pub fn price_distribution(trades: &[Trade], bins: usize) -> Vec<PriceBin> {
    if bins == 0 || trades.is_empty() {
        return Vec::new();
    }

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for t in trades {
        min = min.min(t.price);
        max = max.max(t.price);
    }
    let width = (max - min) / bins as f64;

    let mut counts = vec![0u64; bins];
    for t in trades {
        // Bin assignment clamps the top edge so price == max lands in the
        // last bin; a zero-width range puts everything in bin 0.
        let idx = if width > 0.0 {
            (((t.price - min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| PriceBin {
            bin_start: min + i as f64 * width,
            bin_end: min + (i + 1) as f64 * width,
            count,
        })
        .collect()
}

#[must_use]
pub fn moving_averages(trades: &[Trade]) -> Vec<MaPoint> {
    let mut out = Vec::with_capacity(trades.len());
    let mut sums = [0.0f64; 3];

    for (i, t) in trades.iter().enumerate() {
        for (j, &k) in MA_PERIODS.iter().enumerate() {
            sums[j] += t.price;
            if i >= k {
                sums[j] -= trades[i - k].price;
            }
        }
        // Trailing window shortens toward the start of the series.
        let ma = |j: usize| sums[j] / (i + 1).min(MA_PERIODS[j]) as f64;
        out.push(MaPoint {
            timestamp_ms: t.timestamp_ms,
            price: t.price,
            ma_10: ma(0),
            ma_20: ma(1),
            ma_50: ma(2),
        });
    }

    out
}

#[must_use]
pub fn volume_by_side(trades: &[Trade]) -> VolumeBySide {
    let mut volume = VolumeBySide::default();
    for t in trades {
        match t.side {
            Side::Buy => volume.buy_volume += t.size,
            Side::Sell => volume.sell_volume += t.size,
            Side::Unknown => {}
        }
    }
    volume
}

/// Raw or per-interval-averaged price series. `aggregation_secs` of `None`
/// (or zero) returns one point per trade; otherwise consecutive trades are
/// grouped into fixed intervals and averaged.
#[must_use]
pub fn price_series(trades: &[Trade], aggregation_secs: Option<u32>) -> Vec<PricePoint> {
    let bucket_ms = match aggregation_secs {
        Some(secs) if secs > 0 => i64::from(secs) * 1000,
        _ => {
            return trades
                .iter()
                .map(|t| PricePoint {
                    timestamp_ms: t.timestamp_ms,
                    price: t.price,
                })
                .collect();
        }
    };

    let mut out: Vec<PricePoint> = Vec::new();
    let mut current_bucket: Option<(i64, f64, u32)> = None; // (bucket start, sum, n)
    for t in trades {
        let start = t.timestamp_ms.div_euclid(bucket_ms) * bucket_ms;
        match &mut current_bucket {
            Some((bucket, sum, n)) if *bucket == start => {
                *sum += t.price;
                *n += 1;
            }
            _ => {
                if let Some((bucket, sum, n)) = current_bucket.take() {
                    out.push(PricePoint {
                        timestamp_ms: bucket,
                        price: sum / f64::from(n),
                    });
                }
                current_bucket = Some((start, t.price, 1));
            }
        }
    }
    if let Some((bucket, sum, n)) = current_bucket {
        out.push(PricePoint {
            timestamp_ms: bucket,
            price: sum / f64::from(n),
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Engine: dual-path dispatch
// ---------------------------------------------------------------------------

/// Computes all derived metrics from the analytical store when it is real
/// and healthy, falling back to the trade buffer otherwise. Results are
/// point-in-time snapshots; eventual consistency with concurrent ingestion
/// is expected.
pub struct MetricsEngine {
    store: Arc<dyn AnalyticalStore>,
    query_timeout: Duration,
    /// Set externally once the store mirror is known to be incomplete
    /// (e.g. a failed flush); routes all queries to the buffer.
    store_degraded: Arc<AtomicBool>,
}

impl MetricsEngine {
    #[must_use]
    pub fn new(store: Arc<dyn AnalyticalStore>, query_timeout: Duration) -> Self {
        Self {
            store,
            query_timeout,
            store_degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a degraded flag owned elsewhere (the ingest metrics registry).
    #[must_use]
    pub fn with_degraded_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.store_degraded = flag;
        self
    }

    #[must_use]
    pub fn store_capability(&self) -> StoreCapability {
        self.store.capability()
    }

    /// Window cutoff for a timeframe. The one argument error the engine does
    /// not swallow: a non-positive or non-finite timeframe is a caller bug.
    fn cutoff_ms(timeframe_minutes: f64) -> Result<i64> {
        if !timeframe_minutes.is_finite() || timeframe_minutes <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "timeframe_minutes must be positive and finite, got {timeframe_minutes}"
            )));
        }
        Ok(now_ms() - (timeframe_minutes * 60_000.0) as i64)
    }

    /// Run a store query under the timeout; `None` means "use the buffer".
    async fn prefer_store<T>(
        &self,
        query: impl std::future::Future<Output = Result<T>>,
        op: &'static str,
    ) -> Option<T> {
        if !self.store.capability().is_real() || self.store_degraded.load(Ordering::Relaxed) {
            return None;
        }
        let result = match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(Error::QueryTimeout),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(op, error = %e, "store query unavailable, using buffer");
                None
            }
        }
    }

    pub async fn session_stats(
        &self,
        buffer: &TradeBuffer,
        timeframe_minutes: f64,
    ) -> Result<SessionStats> {
        let cutoff = Self::cutoff_ms(timeframe_minutes)?;
        if let Some(stats) = self
            .prefer_store(self.store.session_stats(cutoff), "session_stats")
            .await
        {
            return Ok(stats);
        }
        Ok(session_stats(&buffer.filter_since(cutoff)))
    }

    pub async fn volatility(
        &self,
        buffer: &TradeBuffer,
        timeframe_minutes: f64,
    ) -> Result<VolatilityStats> {
        let cutoff = Self::cutoff_ms(timeframe_minutes)?;
        if let Some(stats) = self
            .prefer_store(self.store.volatility(cutoff), "volatility")
            .await
        {
            return Ok(stats);
        }
        Ok(volatility(&buffer.filter_since(cutoff)))
    }

    pub async fn price_distribution(
        &self,
        buffer: &TradeBuffer,
        timeframe_minutes: f64,
        bins: usize,
    ) -> Result<Vec<PriceBin>> {
        let cutoff = Self::cutoff_ms(timeframe_minutes)?;
        if let Some(dist) = self
            .prefer_store(
                self.store.price_distribution(cutoff, bins),
                "price_distribution",
            )
            .await
        {
            return Ok(dist);
        }
        Ok(price_distribution(&buffer.filter_since(cutoff), bins))
    }

    pub async fn moving_averages(
        &self,
        buffer: &TradeBuffer,
        timeframe_minutes: f64,
    ) -> Result<Vec<MaPoint>> {
        let cutoff = Self::cutoff_ms(timeframe_minutes)?;
        if let Some(series) = self
            .prefer_store(self.store.moving_averages(cutoff), "moving_averages")
            .await
        {
            return Ok(series);
        }
        Ok(moving_averages(&buffer.filter_since(cutoff)))
    }

    pub async fn volume_by_side(
        &self,
        buffer: &TradeBuffer,
        timeframe_minutes: f64,
    ) -> Result<VolumeBySide> {
        let cutoff = Self::cutoff_ms(timeframe_minutes)?;
        if let Some(volume) = self
            .prefer_store(self.store.volume_by_side(cutoff), "volume_by_side")
            .await
        {
            return Ok(volume);
        }
        Ok(volume_by_side(&buffer.filter_since(cutoff)))
    }

    pub async fn price_series(
        &self,
        buffer: &TradeBuffer,
        timeframe_minutes: f64,
        aggregation_secs: Option<u32>,
    ) -> Result<Vec<PricePoint>> {
        let cutoff = Self::cutoff_ms(timeframe_minutes)?;
        if let Some(series) = self
            .prefer_store(
                self.store.price_series(cutoff, aggregation_secs),
                "price_series",
            )
            .await
        {
            return Ok(series);
        }
        Ok(price_series(&buffer.filter_since(cutoff), aggregation_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockStore, SqliteStore};
    use crate::testutil::{trade_at, trade_with_side};

    fn prices(ps: &[f64]) -> Vec<Trade> {
        ps.iter()
            .enumerate()
            .map(|(i, &p)| trade_at(i as i64 * 1000, p))
            .collect()
    }

    #[test]
    fn session_stats_scenario() {
        let trades = prices(&[100.0, 110.0, 90.0]);
        let stats = session_stats(&trades);
        assert_eq!(stats.high, 110.0);
        assert_eq!(stats.low, 90.0);
        assert_eq!(stats.first, 100.0);
        assert_eq!(stats.current, 90.0);
        assert_eq!(stats.change_percent, -10.0);
        assert_eq!(stats.trade_count, 3);
        assert_eq!(stats.avg_price, 100.0);
    }

    #[test]
    fn change_percent_zero_for_tiny_windows() {
        assert_eq!(session_stats(&[]).change_percent, 0.0);
        let one = prices(&[123.45]);
        let stats = session_stats(&one);
        assert_eq!(stats.change_percent, 0.0);
        assert_eq!(stats.first, 123.45);
        assert_eq!(stats.current, 123.45);
    }

    #[test]
    fn volatility_constant_series_is_zero() {
        let trades = prices(&[250.0; 20]);
        let stats = volatility(&trades);
        assert_eq!(stats.volatility, 0.0);
        assert_eq!(stats.avg_change, 0.0);
    }

    #[test]
    fn volatility_known_values() {
        // Single 10% change: population stddev of one sample is 0.
        let stats = volatility(&prices(&[100.0, 110.0]));
        assert_eq!(stats.volatility, 0.0);
        assert!((stats.avg_change - 10.0).abs() < 1e-9);

        // +10% then -10%: mean 0, stddev 10.
        let stats = volatility(&prices(&[100.0, 110.0, 99.0]));
        assert!((stats.volatility - 10.0).abs() < 1e-9);
        assert!((stats.avg_change - 10.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_needs_two_trades() {
        assert_eq!(volatility(&[]), VolatilityStats::default());
        assert_eq!(volatility(&prices(&[42.0])), VolatilityStats::default());
    }

    #[test]
    fn distribution_counts_sum_to_trade_count() {
        let trades = prices(&[100.0, 101.0, 102.5, 104.9, 105.0, 103.3, 100.0]);
        for bins in 1..=16 {
            let dist = price_distribution(&trades, bins);
            assert_eq!(dist.len(), bins);
            let total: u64 = dist.iter().map(|b| b.count).sum();
            assert_eq!(total, trades.len() as u64, "bins = {bins}");
        }
    }

    #[test]
    fn distribution_top_edge_lands_in_last_bin() {
        let trades = prices(&[100.0, 110.0]);
        let dist = price_distribution(&trades, 10);
        assert_eq!(dist[0].count, 1);
        assert_eq!(dist[9].count, 1);
        assert_eq!(dist[0].bin_start, 100.0);
        assert!((dist[9].bin_end - 110.0).abs() < 1e-9);
    }

    #[test]
    fn distribution_degenerate_cases() {
        assert!(price_distribution(&[], 10).is_empty());
        assert!(price_distribution(&prices(&[1.0]), 0).is_empty());

        // All trades at one price: everything in bin 0.
        let dist = price_distribution(&prices(&[50.0; 5]), 4);
        assert_eq!(dist[0].count, 5);
        assert!(dist[1..].iter().all(|b| b.count == 0));
    }

    #[test]
    fn moving_averages_shorten_near_start() {
        let trades = prices(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let series = moving_averages(&trades);
        assert_eq!(series.len(), trades.len());
        assert_eq!(series[0].ma_10, 1.0); // index 0 always equals price[0]
        assert_eq!(series[0].ma_50, 1.0);
        assert_eq!(series[2].ma_10, 2.0); // mean of [1, 2, 3]
        assert_eq!(series[4].ma_20, 3.0); // mean of [1..=5]
    }

    #[test]
    fn moving_averages_full_window() {
        let trades: Vec<Trade> = (0..60).map(|i| trade_at(i, (i + 1) as f64)).collect();
        let series = moving_averages(&trades);
        // At index 59, ma_10 = mean(51..=60) = 55.5, ma_50 = mean(11..=60) = 35.5.
        assert!((series[59].ma_10 - 55.5).abs() < 1e-9);
        assert!((series[59].ma_50 - 35.5).abs() < 1e-9);
    }

    #[test]
    fn volume_excludes_unknown_side() {
        let trades = vec![
            trade_with_side(0, 100.0, 1.0, Side::Buy),
            trade_with_side(1, 100.0, 2.0, Side::Sell),
            trade_with_side(2, 100.0, 4.0, Side::Buy),
            trade_with_side(3, 100.0, 8.0, Side::Unknown),
        ];
        let volume = volume_by_side(&trades);
        assert_eq!(volume.buy_volume, 5.0);
        assert_eq!(volume.sell_volume, 2.0);
    }

    #[test]
    fn price_series_aggregation_buckets() {
        let trades = vec![
            trade_at(0, 100.0),
            trade_at(400, 110.0),
            trade_at(1200, 120.0),
        ];
        let raw = price_series(&trades, None);
        assert_eq!(raw.len(), 3);

        let agg = price_series(&trades, Some(1));
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].timestamp_ms, 0);
        assert_eq!(agg[0].price, 105.0);
        assert_eq!(agg[1].timestamp_ms, 1000);
        assert_eq!(agg[1].price, 120.0);
    }

    #[tokio::test]
    async fn engine_rejects_invalid_timeframe() {
        let engine = MetricsEngine::new(Arc::new(MockStore), Duration::from_secs(1));
        let buffer = TradeBuffer::new(10);
        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let err = engine.session_stats(&buffer, bad).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "timeframe {bad}");
        }
    }

    #[tokio::test]
    async fn degraded_flag_routes_queries_to_buffer() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_schema().await.unwrap();
        let now = now_ms();
        store.insert_batch(&[trade_at(now, 500.0)]).await.unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let engine = MetricsEngine::new(Arc::new(store), Duration::from_secs(1))
            .with_degraded_flag(Arc::clone(&flag));
        let mut buffer = TradeBuffer::new(10);
        for (i, p) in [100.0, 110.0, 90.0].iter().enumerate() {
            buffer.push(trade_at(now + i as i64, *p));
        }

        // Healthy store wins even though the buffer disagrees.
        let stats = engine.session_stats(&buffer, 5.0).await.unwrap();
        assert_eq!(stats.trade_count, 1);
        assert_eq!(stats.current, 500.0);

        // Once flagged degraded, the buffer takes over.
        flag.store(true, Ordering::Relaxed);
        let stats = engine.session_stats(&buffer, 5.0).await.unwrap();
        assert_eq!(stats.trade_count, 3);
        assert_eq!(stats.change_percent, -10.0);
    }

    #[tokio::test]
    async fn engine_uses_buffer_with_mock_store() {
        let engine = MetricsEngine::new(Arc::new(MockStore), Duration::from_secs(1));
        let mut buffer = TradeBuffer::new(10);
        let now = now_ms();
        for (i, p) in [100.0, 110.0, 90.0].iter().enumerate() {
            buffer.push(trade_at(now - 1000 + i as i64, *p));
        }
        let stats = engine.session_stats(&buffer, 5.0).await.unwrap();
        assert_eq!(stats.change_percent, -10.0);
        assert_eq!(stats.trade_count, 3);
    }
}
