//! Key-value cache: dedup markers, liveness, cooldowns, tariff snapshots.
//!
//! Keyspace layout (TTLs from `config::defaults`):
//!
//! | Key | TTL | Purpose |
//! |---|---|---|
//! | `reading:{meter}:{ts}` | 60 s | ingestion dedup (atomic set-if-absent) |
//! | `last_seen:{meter}` | 1 h | meter liveness for the outage rule |
//! | `region_load:{region}` | 5 m | last known regional load |
//! | `overload_windows:{region}` | 10 m | sorted set of overload minutes |
//! | `cooldown:{rule}:region:{r}:meter:{m}` | per rule | rule cooldown marker |
//! | `tariff:{region}` | none | current tariff price |
//! | `active_alert:{region}:{type}[:meter]` | 5 m | cross-engine alert dedup |
//!
//! Callers own the availability policy: ingestion dedup fails open (a cache
//! error admits the reading), cooldown and dedup markers fail closed (a
//! cache error suppresses the alert).

mod sorted;
mod ttl_map;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::defaults::{
    ACTIVE_ALERT_TTL_SECS, DEDUP_TTL_SECS, LAST_SEEN_TTL_SECS, OVERLOAD_WINDOW_TTL_SECS,
    REGION_LOAD_TTL_SECS,
};

pub use sorted::ScoreSets;
pub use ttl_map::TtlMap;

/// Cache operation failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable")]
    Unavailable,
    #[error("cache value corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Liveness record stored under `last_seen:{meter}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterLiveness {
    pub region: String,
    pub last_seen: DateTime<Utc>,
}

/// In-process cache shared by the gateway, processor, and engines.
#[derive(Debug, Default)]
pub struct Cache {
    kv: TtlMap,
    zsets: ScoreSets,
    #[cfg(test)]
    poisoned: std::sync::atomic::AtomicBool,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<(), CacheError> {
        #[cfg(test)]
        if self.poisoned.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CacheError::Unavailable);
        }
        Ok(())
    }

    /// Simulate an unavailable backend so policy branches can be exercised.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        self.poisoned
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Ingestion dedup
    // ------------------------------------------------------------------

    /// Claim the dedup slot for `(meter_id, timestamp)`.
    ///
    /// Returns `true` iff this is the first sighting within the TTL.
    pub fn claim_reading(
        &self,
        meter_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        self.check()?;
        let key = format!("reading:{meter_id}:{}", timestamp.timestamp_millis());
        Ok(self
            .kv
            .set_if_absent(&key, "1", Some(Duration::from_secs(DEDUP_TTL_SECS))))
    }

    // ------------------------------------------------------------------
    // Meter liveness
    // ------------------------------------------------------------------

    pub fn update_meter_last_seen(
        &self,
        meter_id: &str,
        region: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        self.check()?;
        let record = MeterLiveness {
            region: region.to_string(),
            last_seen: seen_at,
        };
        self.kv.set(
            &format!("last_seen:{meter_id}"),
            &serde_json::to_string(&record)?,
            Some(Duration::from_secs(LAST_SEEN_TTL_SECS)),
        );
        Ok(())
    }

    pub fn meter_last_seen(&self, meter_id: &str) -> Result<Option<MeterLiveness>, CacheError> {
        self.check()?;
        self.kv
            .get(&format!("last_seen:{meter_id}"))
            .map(|raw| serde_json::from_str(&raw).map_err(CacheError::from))
            .transpose()
    }

    /// All live `(meter_id, liveness)` pairs, for the outage sweep.
    pub fn all_meter_liveness(&self) -> Result<Vec<(String, MeterLiveness)>, CacheError> {
        self.check()?;
        let mut out = Vec::new();
        for (meter_id, raw) in self.kv.scan_prefix("last_seen:") {
            match serde_json::from_str(&raw) {
                Ok(liveness) => out.push((meter_id, liveness)),
                Err(e) => debug!("Skipping corrupt liveness entry for {meter_id}: {e}"),
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Regional load
    // ------------------------------------------------------------------

    pub fn update_region_load(&self, region: &str, load_percentage: f64) -> Result<(), CacheError> {
        self.check()?;
        self.kv.set(
            &format!("region_load:{region}"),
            &load_percentage.to_string(),
            Some(Duration::from_secs(REGION_LOAD_TTL_SECS)),
        );
        Ok(())
    }

    pub fn region_load(&self, region: &str) -> Result<Option<f64>, CacheError> {
        self.check()?;
        Ok(self
            .kv
            .get(&format!("region_load:{region}"))
            .and_then(|raw| raw.parse().ok()))
    }

    pub fn all_region_loads(&self) -> Result<Vec<(String, f64)>, CacheError> {
        self.check()?;
        Ok(self
            .kv
            .scan_prefix("region_load:")
            .into_iter()
            .filter_map(|(region, raw)| raw.parse().ok().map(|load| (region, load)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Overload windows
    // ------------------------------------------------------------------

    /// Record that `minute_start` (Unix seconds) was an overload minute.
    pub fn record_overload_minute(&self, region: &str, minute_start: i64) -> Result<(), CacheError> {
        self.check()?;
        self.zsets.add(
            &format!("overload_windows:{region}"),
            minute_start,
            &minute_start.to_string(),
            Some(Duration::from_secs(OVERLOAD_WINDOW_TTL_SECS)),
        );
        Ok(())
    }

    pub fn overload_minutes_between(
        &self,
        region: &str,
        from: i64,
        to: i64,
    ) -> Result<usize, CacheError> {
        self.check()?;
        Ok(self
            .zsets
            .count_in_range(&format!("overload_windows:{region}"), from, to))
    }

    pub fn trim_overload_before(&self, region: &str, cutoff: i64) -> Result<usize, CacheError> {
        self.check()?;
        Ok(self
            .zsets
            .trim_below(&format!("overload_windows:{region}"), cutoff))
    }

    // ------------------------------------------------------------------
    // Rule cooldowns & alert dedup
    // ------------------------------------------------------------------

    fn cooldown_key(rule_id: &str, region: Option<&str>, meter_id: Option<&str>) -> String {
        format!(
            "cooldown:{rule_id}:region:{}:meter:{}",
            region.unwrap_or("-"),
            meter_id.unwrap_or("-")
        )
    }

    /// True when a cooldown marker is live for this rule scope.
    pub fn cooldown_active(
        &self,
        rule_id: &str,
        region: Option<&str>,
        meter_id: Option<&str>,
    ) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self
            .kv
            .get(&Self::cooldown_key(rule_id, region, meter_id))
            .is_some())
    }

    /// Claim the cooldown slot for a rule scope. `true` means the caller
    /// may alert; `false` means a previous alert is still cooling down.
    pub fn claim_cooldown(
        &self,
        rule_id: &str,
        region: Option<&str>,
        meter_id: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check()?;
        if ttl.is_zero() {
            return Ok(true);
        }
        Ok(self
            .kv
            .set_if_absent(&Self::cooldown_key(rule_id, region, meter_id), "1", Some(ttl)))
    }

    /// Claim the cross-engine dedup marker for a logical alert.
    pub fn claim_active_alert(
        &self,
        region: Option<&str>,
        alert_type: &str,
        meter_id: Option<&str>,
    ) -> Result<bool, CacheError> {
        self.check()?;
        let mut key = format!("active_alert:{}:{alert_type}", region.unwrap_or("-"));
        if let Some(meter) = meter_id {
            key.push(':');
            key.push_str(meter);
        }
        Ok(self
            .kv
            .set_if_absent(&key, "1", Some(Duration::from_secs(ACTIVE_ALERT_TTL_SECS))))
    }

    // ------------------------------------------------------------------
    // Tariff snapshot
    // ------------------------------------------------------------------

    pub fn set_tariff(&self, region: &str, price_per_kwh: f64) -> Result<(), CacheError> {
        self.check()?;
        self.kv
            .set(&format!("tariff:{region}"), &price_per_kwh.to_string(), None);
        Ok(())
    }

    pub fn tariff(&self, region: &str) -> Result<Option<f64>, CacheError> {
        self.check()?;
        Ok(self
            .kv
            .get(&format!("tariff:{region}"))
            .and_then(|raw| raw.parse().ok()))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict expired entries; returns total evictions.
    pub fn sweep(&self) -> usize {
        self.kv.sweep() + self.zsets.sweep()
    }
}
