//! Meter reading types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sampling status reported by the meter itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadingStatus {
    Ok,
    Error,
}

/// A single meter sample as it travels from the gateway through
/// `raw_readings`.
///
/// `(meter_id, timestamp)` uniquely identifies a logical reading; the
/// gateway dedups on that pair and never on `reading_id`. Raw readings are
/// ephemeral: they exist only on the bus and in the processor's open
/// windows, never in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_id: Option<Uuid>,
    pub meter_id: String,
    pub region: String,
    pub timestamp: DateTime<Utc>,
    pub power_kw: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_kwh: Option<f64>,
    /// Local feed-in (rooftop solar and the like), reported only by
    /// meters that have generation behind them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_kw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReadingStatus>,
}

impl Reading {
    /// Unix-second bucket start for a window of `window_secs`.
    pub fn bucket_start(&self, window_secs: i64) -> i64 {
        let ts = self.timestamp.timestamp();
        ts - ts.rem_euclid(window_secs)
    }
}
