//! Windowed aggregate payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-meter aggregate for one window (1-minute or 15-minute).
///
/// Persisted with primary key `(meter_id, window_start)` and published on
/// `aggregates_1m` / `aggregates_15m` keyed by meter. Upsert semantics make
/// redelivered flushes idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterAggregate {
    pub meter_id: String,
    pub region: String,
    pub window_start: DateTime<Utc>,
    pub avg_power_kw: f64,
    pub max_power_kw: f64,
    pub energy_kwh_sum: f64,
    /// Average local feed-in over the window. `None` when the meter never
    /// reported generation in this window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_generation_kw: Option<f64>,
    pub count: u64,
}

/// Per-region rollup derived at 1-minute flush time.
///
/// `total_power_kw` is the sum of per-meter averages, not raw samples, so a
/// meter reporting at 2 Hz carries the same weight as one at 0.2 Hz.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalAggregate {
    pub region: String,
    pub window_start: DateTime<Utc>,
    pub meter_count: usize,
    pub total_power_kw: f64,
    pub max_power_kw: f64,
    pub min_power_kw: f64,
    pub active_meter_ids: Vec<String>,
    pub load_percentage: f64,
    /// Local generation as a share of regional load. `None` when no meter
    /// in the window reported generation, so regions without feed-in never
    /// look under-generating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_percentage: Option<f64>,
}
