//! Aggregate tables: batch upsert and the last-average baseline lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::MeterAggregate;

use super::{Store, StoreError};

/// Latest known 1-minute average per meter, kept alongside the aggregate
/// rows so the anomaly detector's cold-start query is a point read.
#[derive(Debug, Serialize, Deserialize)]
struct LastAvg {
    window_start: DateTime<Utc>,
    avg_power_kw: f64,
}

/// Composite key `(meter_id, window_start)`. Big-endian seconds keep
/// per-meter windows chronologically ordered in the tree.
fn agg_key(meter_id: &str, window_start: DateTime<Utc>) -> Vec<u8> {
    let mut key = Vec::with_capacity(meter_id.len() + 9);
    key.extend_from_slice(meter_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&window_start.timestamp().to_be_bytes());
    key
}

impl Store {
    /// Batch-upsert 1-minute aggregates; replaces on key conflict so
    /// redelivered flushes are idempotent. Also advances the per-meter
    /// last-average pointer.
    pub async fn upsert_aggregates_1m(&self, rows: &[MeterAggregate]) -> Result<(), StoreError> {
        let _permit = self.write_permit().await?;
        let mut batch = sled::Batch::default();
        for row in rows {
            batch.insert(agg_key(&row.meter_id, row.window_start), serde_json::to_vec(row)?);
        }
        self.agg_1m.apply_batch(batch)?;

        for row in rows {
            self.advance_last_avg(row)?;
        }
        Ok(())
    }

    /// Batch-upsert 15-minute aggregates.
    pub async fn upsert_aggregates_15m(&self, rows: &[MeterAggregate]) -> Result<(), StoreError> {
        let _permit = self.write_permit().await?;
        let mut batch = sled::Batch::default();
        for row in rows {
            batch.insert(agg_key(&row.meter_id, row.window_start), serde_json::to_vec(row)?);
        }
        self.agg_15m.apply_batch(batch)?;
        Ok(())
    }

    fn advance_last_avg(&self, row: &MeterAggregate) -> Result<(), StoreError> {
        let current: Option<LastAvg> = self
            .last_avg
            .get(row.meter_id.as_bytes())?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()?;
        if current.is_none_or(|c| row.window_start >= c.window_start) {
            self.last_avg.insert(
                row.meter_id.as_bytes(),
                serde_json::to_vec(&LastAvg {
                    window_start: row.window_start,
                    avg_power_kw: row.avg_power_kw,
                })?,
            )?;
        }
        Ok(())
    }

    /// Last known 1-minute average power for a meter, if any.
    pub fn last_avg_power_for_meter(&self, meter_id: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .last_avg
            .get(meter_id.as_bytes())?
            .map(|raw| serde_json::from_slice::<LastAvg>(&raw))
            .transpose()?
            .map(|last| last.avg_power_kw))
    }

    /// Stored aggregate for an exact `(meter, window)`, used by tests and
    /// spot queries.
    pub fn aggregate_1m(
        &self,
        meter_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<MeterAggregate>, StoreError> {
        Ok(self
            .agg_1m
            .get(agg_key(meter_id, window_start))?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()?)
    }

    /// Stored 15-minute aggregate for an exact `(meter, window)`.
    pub fn aggregate_15m(
        &self,
        meter_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<MeterAggregate>, StoreError> {
        Ok(self
            .agg_15m
            .get(agg_key(meter_id, window_start))?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    fn agg(meter: &str, window: &str, avg: f64) -> MeterAggregate {
        MeterAggregate {
            meter_id: meter.to_string(),
            region: "Pune-West".to_string(),
            window_start: window.parse().unwrap(),
            avg_power_kw: avg,
            max_power_kw: avg * 2.0,
            energy_kwh_sum: 1.0,
            avg_generation_kw: None,
            count: 6,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_on_conflict() {
        let (_dir, store) = test_store();
        let window = "2025-11-07T10:00:00Z";
        store
            .upsert_aggregates_1m(&[agg("MTR-1", window, 3.0)])
            .await
            .unwrap();
        store
            .upsert_aggregates_1m(&[agg("MTR-1", window, 4.5)])
            .await
            .unwrap();
        let row = store
            .aggregate_1m("MTR-1", window.parse().unwrap())
            .unwrap()
            .unwrap();
        assert!((row.avg_power_kw - 4.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn last_avg_tracks_newest_window() {
        let (_dir, store) = test_store();
        store
            .upsert_aggregates_1m(&[
                agg("MTR-1", "2025-11-07T10:01:00Z", 5.0),
                agg("MTR-1", "2025-11-07T10:00:00Z", 2.0),
            ])
            .await
            .unwrap();
        // The older window must not clobber the newer average.
        assert_eq!(store.last_avg_power_for_meter("MTR-1").unwrap(), Some(5.0));
        assert_eq!(store.last_avg_power_for_meter("MTR-9").unwrap(), None);
    }

    #[tokio::test]
    async fn fifteen_minute_rows_are_separate() {
        let (_dir, store) = test_store();
        let window = "2025-11-07T10:00:00Z";
        store
            .upsert_aggregates_15m(&[agg("MTR-1", window, 3.0)])
            .await
            .unwrap();
        assert!(store
            .aggregate_1m("MTR-1", window.parse().unwrap())
            .unwrap()
            .is_none());
        assert!(store
            .aggregate_15m("MTR-1", window.parse().unwrap())
            .unwrap()
            .is_some());
    }
}
