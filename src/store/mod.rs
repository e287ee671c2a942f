//! Durable persistence on sled.
//!
//! One database, one tree per logical table:
//! - `aggregates_1m` / `aggregates_15m`: per-meter windows, key
//!   `meter_id \0 window_start_be`, replace-on-conflict.
//! - `meter_last_avg`: latest 1-minute average per meter, the anomaly
//!   detector's cold-start baseline.
//! - `tariffs` (history, key `region \0 effective_from_be`) and
//!   `tariff_current` (region → latest row).
//! - `alerts` (key `timestamp_be ++ id`, newest-last for ordered scans)
//!   with `alerts_by_id` as the point-lookup index.
//!
//! Writes funnel through a bounded lane (20 permits) so a flood of flushes
//! cannot starve reads; `pool_stats` exposes the lane for observability.

mod alerts;
mod tariffs;
mod timeseries;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Write-lane width. Mirrors the upstream connection-pool sizing.
const WRITE_LANE_PERMITS: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store closed")]
    Closed,
}

/// Write-lane utilisation snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub waiting: usize,
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    agg_1m: sled::Tree,
    agg_15m: sled::Tree,
    last_avg: sled::Tree,
    tariffs: sled::Tree,
    tariff_current: sled::Tree,
    alerts: sled::Tree,
    alerts_by_id: sled::Tree,
    write_lane: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            agg_1m: db.open_tree("aggregates_1m")?,
            agg_15m: db.open_tree("aggregates_15m")?,
            last_avg: db.open_tree("meter_last_avg")?,
            tariffs: db.open_tree("tariffs")?,
            tariff_current: db.open_tree("tariff_current")?,
            alerts: db.open_tree("alerts")?,
            alerts_by_id: db.open_tree("alerts_by_id")?,
            db,
            write_lane: Arc::new(Semaphore::new(WRITE_LANE_PERMITS)),
            waiting: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Acquire a write permit, tracking queue depth for `pool_stats`.
    async fn write_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, StoreError> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = self.write_lane.acquire().await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        permit.map_err(|_| StoreError::Closed)
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            total: WRITE_LANE_PERMITS,
            idle: self.write_lane.available_permits(),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }

    /// Flush pending writes to disk (shutdown path).
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    #[allow(clippy::unwrap_used)]
    {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gridpulse.db")).unwrap();
        (dir, store)
    }
}
