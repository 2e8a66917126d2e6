//! Analytical trade store.
//!
//! The real backend is an in-memory SQLite database behind an async mutex;
//! all analytical queries are expressed as SQL aggregations with bound
//! parameters. Bootstrap races database setup against a deadline, and a
//! setup that loses the race (or fails outright) yields [`MockStore`], a
//! no-op backend that keeps the rest of the pipeline alive on the buffer
//! fallback path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::analytics::{
    MaPoint, PriceBin, PricePoint, SessionStats, VolatilityStats, VolumeBySide,
};
use crate::error::Result;
use crate::types::Trade;

/// Whether a store backend actually persists and aggregates trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCapability {
    /// SQLite-backed: inserts persist, queries aggregate in SQL.
    Real,
    /// No-op stand-in: inserts are dropped, queries return empty shapes.
    Mock,
}

impl StoreCapability {
    #[must_use]
    pub fn is_real(self) -> bool {
        matches!(self, StoreCapability::Real)
    }
}

/// Storage and SQL-side analytics over the trade history.
///
/// Implementations must tolerate out-of-order timestamps; ordering is
/// imposed at query time (`ts_ms`, then insertion order).
#[async_trait]
pub trait AnalyticalStore: Send + Sync {
    fn capability(&self) -> StoreCapability;

    async fn ensure_schema(&self) -> Result<()>;

    async fn insert_batch(&self, trades: &[Trade]) -> Result<usize>;

    /// Delete all but the newest `keep` rows.
    async fn prune_to_capacity(&self, keep: usize) -> Result<usize>;

    async fn trade_count(&self) -> Result<u64>;

    async fn session_stats(&self, cutoff_ms: i64) -> Result<SessionStats>;

    async fn volatility(&self, cutoff_ms: i64) -> Result<VolatilityStats>;

    async fn price_distribution(&self, cutoff_ms: i64, bins: usize) -> Result<Vec<PriceBin>>;

    async fn moving_averages(&self, cutoff_ms: i64) -> Result<Vec<MaPoint>>;

    async fn volume_by_side(&self, cutoff_ms: i64) -> Result<VolumeBySide>;

    async fn price_series(
        &self,
        cutoff_ms: i64,
        aggregation_secs: Option<u32>,
    ) -> Result<Vec<PricePoint>>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }
}

#[async_trait]
impl AnalyticalStore for SqliteStore {
    fn capability(&self) -> StoreCapability {
        StoreCapability::Real
    }

    async fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                 id       INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts_ms    INTEGER NOT NULL,
                 price    REAL    NOT NULL,
                 size     REAL    NOT NULL,
                 side     TEXT    NOT NULL,
                 exchange TEXT    NOT NULL,
                 pair     TEXT    NOT NULL
             )",
            [],
        )?;
        // Index creation is best-effort; queries stay correct without it.
        if let Err(e) = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades (ts_ms)",
            [],
        ) {
            warn!(error = %e, "failed to create timestamp index, continuing without it");
        }
        Ok(())
    }

    async fn insert_batch(&self, trades: &[Trade]) -> Result<usize> {
        if trades.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trades (ts_ms, price, size, side, exchange, pair)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for t in trades {
                stmt.execute(params![
                    t.timestamp_ms,
                    t.price,
                    t.size,
                    t.side.as_str(),
                    t.exchange.as_str(),
                    t.pair,
                ])?;
            }
        }
        tx.commit()?;
        Ok(trades.len())
    }

    async fn prune_to_capacity(&self, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM trades WHERE id NOT IN
                 (SELECT id FROM trades ORDER BY ts_ms DESC, id DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        if deleted > 0 {
            debug!(deleted, keep, "pruned trade history");
        }
        Ok(deleted)
    }

    async fn trade_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn session_stats(&self, cutoff_ms: i64) -> Result<SessionStats> {
        let conn = self.conn.lock().await;
        let (count, high, low, avg, first, current) = conn.query_row(
            "SELECT COUNT(*), MAX(price), MIN(price), AVG(price),
                    (SELECT price FROM trades WHERE ts_ms >= ?1
                         ORDER BY ts_ms ASC, id ASC LIMIT 1),
                    (SELECT price FROM trades WHERE ts_ms >= ?1
                         ORDER BY ts_ms DESC, id DESC LIMIT 1)
             FROM trades WHERE ts_ms >= ?1",
            params![cutoff_ms],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                ))
            },
        )?;

        if count == 0 {
            return Ok(SessionStats::default());
        }
        let first = first.unwrap_or_default();
        let current = current.unwrap_or_default();
        let change_percent = if count < 2 || first == 0.0 {
            0.0
        } else {
            (current - first) / first * 100.0
        };
        Ok(SessionStats {
            high: high.unwrap_or_default(),
            low: low.unwrap_or_default(),
            first,
            current,
            change_percent,
            trade_count: count as u64,
            avg_price: avg.unwrap_or_default(),
        })
    }

    async fn volatility(&self, cutoff_ms: i64) -> Result<VolatilityStats> {
        let conn = self.conn.lock().await;
        let (count, avg, avg_sq, avg_abs) = conn.query_row(
            "WITH changes AS (
                 SELECT (price - LAG(price) OVER w) / LAG(price) OVER w * 100.0 AS pct
                 FROM trades WHERE ts_ms >= ?1
                 WINDOW w AS (ORDER BY ts_ms, id)
             )
             SELECT COUNT(pct), AVG(pct), AVG(pct * pct), AVG(ABS(pct))
             FROM changes",
            params![cutoff_ms],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;

        if count == 0 {
            return Ok(VolatilityStats::default());
        }
        // Population stddev from the first two moments; clamp guards the
        // tiny negative values floating-point subtraction can produce.
        let mean = avg.unwrap_or_default();
        let variance = (avg_sq.unwrap_or_default() - mean * mean).max(0.0);
        Ok(VolatilityStats {
            volatility: variance.sqrt(),
            avg_change: avg_abs.unwrap_or_default(),
        })
    }

    async fn price_distribution(&self, cutoff_ms: i64, bins: usize) -> Result<Vec<PriceBin>> {
        if bins == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let range: Option<(f64, f64)> = conn
            .query_row(
                "SELECT MIN(price), MAX(price) FROM trades WHERE ts_ms >= ?1",
                params![cutoff_ms],
                |row| {
                    Ok(match (row.get::<_, Option<f64>>(0)?, row.get::<_, Option<f64>>(1)?) {
                        (Some(min), Some(max)) => Some((min, max)),
                        _ => None,
                    })
                },
            )?;
        let Some((min, max)) = range else {
            return Ok(Vec::new());
        };
        let width = (max - min) / bins as f64;

        let mut counts: HashMap<usize, u64> = HashMap::new();
        if width > 0.0 {
            let mut stmt = conn.prepare_cached(
                "SELECT MIN(CAST((price - ?2) / ?3 AS INTEGER), ?4) AS bin, COUNT(*)
                 FROM trades WHERE ts_ms >= ?1 GROUP BY bin",
            )?;
            let rows = stmt.query_map(
                params![cutoff_ms, min, width, (bins - 1) as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?;
            for row in rows {
                let (bin, count) = row?;
                counts.insert(bin as usize, count as u64);
            }
        } else {
            // Zero-width range: everything in bin 0.
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trades WHERE ts_ms >= ?1",
                params![cutoff_ms],
                |row| row.get(0),
            )?;
            counts.insert(0, count as u64);
        }

        Ok((0..bins)
            .map(|i| PriceBin {
                bin_start: min + i as f64 * width,
                bin_end: min + (i + 1) as f64 * width,
                count: counts.get(&i).copied().unwrap_or(0),
            })
            .collect())
    }

    async fn moving_averages(&self, cutoff_ms: i64) -> Result<Vec<MaPoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts_ms, price,
                    AVG(price) OVER (ORDER BY ts_ms, id
                        ROWS BETWEEN 9 PRECEDING AND CURRENT ROW),
                    AVG(price) OVER (ORDER BY ts_ms, id
                        ROWS BETWEEN 19 PRECEDING AND CURRENT ROW),
                    AVG(price) OVER (ORDER BY ts_ms, id
                        ROWS BETWEEN 49 PRECEDING AND CURRENT ROW)
             FROM trades WHERE ts_ms >= ?1
             ORDER BY ts_ms, id",
            )?;
        let rows = stmt.query_map(params![cutoff_ms], |row| {
            Ok(MaPoint {
                timestamp_ms: row.get(0)?,
                price: row.get(1)?,
                ma_10: row.get(2)?,
                ma_20: row.get(3)?,
                ma_50: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn volume_by_side(&self, cutoff_ms: i64) -> Result<VolumeBySide> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT side, SUM(size) FROM trades
             WHERE ts_ms >= ?1 AND side IN ('buy', 'sell')
             GROUP BY side",
        )?;
        let rows = stmt.query_map(params![cutoff_ms], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut volume = VolumeBySide::default();
        for row in rows {
            let (side, total) = row?;
            match side.as_str() {
                "buy" => volume.buy_volume = total,
                "sell" => volume.sell_volume = total,
                _ => {}
            }
        }
        Ok(volume)
    }

    async fn price_series(
        &self,
        cutoff_ms: i64,
        aggregation_secs: Option<u32>,
    ) -> Result<Vec<PricePoint>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match aggregation_secs {
            Some(secs) if secs > 0 => {
                let bucket_ms = i64::from(secs) * 1000;
                let mut stmt = conn.prepare_cached(
                    "SELECT (ts_ms / ?2) * ?2 AS bucket, AVG(price)
                     FROM trades WHERE ts_ms >= ?1
                     GROUP BY bucket ORDER BY bucket",
                )?;
                let rows = stmt.query_map(params![cutoff_ms, bucket_ms], |row| {
                    Ok(PricePoint {
                        timestamp_ms: row.get(0)?,
                        price: row.get(1)?,
                    })
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let mut stmt = conn.prepare_cached(
                    "SELECT ts_ms, price FROM trades WHERE ts_ms >= ?1
                     ORDER BY ts_ms, id",
                )?;
                let rows = stmt.query_map(params![cutoff_ms], |row| {
                    Ok(PricePoint {
                        timestamp_ms: row.get(0)?,
                        price: row.get(1)?,
                    })
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// No-op store used when SQLite setup fails or misses the bootstrap
/// deadline. Every method succeeds with an empty shape, so callers see a
/// healthy-but-empty store and route analytics through the buffer.
pub struct MockStore;

#[async_trait]
impl AnalyticalStore for MockStore {
    fn capability(&self) -> StoreCapability {
        StoreCapability::Mock
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, _trades: &[Trade]) -> Result<usize> {
        Ok(0)
    }

    async fn prune_to_capacity(&self, _keep: usize) -> Result<usize> {
        Ok(0)
    }

    async fn trade_count(&self) -> Result<u64> {
        Ok(0)
    }

    async fn session_stats(&self, _cutoff_ms: i64) -> Result<SessionStats> {
        Ok(SessionStats::default())
    }

    async fn volatility(&self, _cutoff_ms: i64) -> Result<VolatilityStats> {
        Ok(VolatilityStats::default())
    }

    async fn price_distribution(&self, _cutoff_ms: i64, _bins: usize) -> Result<Vec<PriceBin>> {
        Ok(Vec::new())
    }

    async fn moving_averages(&self, _cutoff_ms: i64) -> Result<Vec<MaPoint>> {
        Ok(Vec::new())
    }

    async fn volume_by_side(&self, _cutoff_ms: i64) -> Result<VolumeBySide> {
        Ok(VolumeBySide::default())
    }

    async fn price_series(
        &self,
        _cutoff_ms: i64,
        _aggregation_secs: Option<u32>,
    ) -> Result<Vec<PricePoint>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Open the SQLite store and create its schema, falling back to
/// [`MockStore`] if setup fails or exceeds `bootstrap_timeout`.
pub async fn init_store(bootstrap_timeout: Duration) -> Arc<dyn AnalyticalStore> {
    let setup = async {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory).await??;
        let store = SqliteStore::new(conn);
        store.ensure_schema().await?;
        Ok::<_, crate::error::Error>(store)
    };
    select_store(bootstrap_timeout, setup).await
}

/// Race a store setup future against the bootstrap deadline.
async fn select_store(
    bootstrap_timeout: Duration,
    setup: impl std::future::Future<Output = Result<SqliteStore>>,
) -> Arc<dyn AnalyticalStore> {
    match tokio::time::timeout(bootstrap_timeout, setup).await {
        Ok(Ok(store)) => {
            info!("analytical store ready (sqlite in-memory)");
            Arc::new(store)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "analytical store setup failed, falling back to mock store");
            Arc::new(MockStore)
        }
        Err(_) => {
            warn!(
                timeout_ms = bootstrap_timeout.as_millis() as u64,
                "analytical store setup timed out, falling back to mock store"
            );
            Arc::new(MockStore)
        }
    }
}
