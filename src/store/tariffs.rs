//! Tariff history and current-tariff rows.

use chrono::{DateTime, Utc};

use crate::types::Tariff;

use super::{Store, StoreError};

/// History key `region \0 effective_from_millis_be`; range scans per
/// region come back in effective-from order.
fn history_key(region: &str, effective_from: DateTime<Utc>) -> Vec<u8> {
    let mut key = Vec::with_capacity(region.len() + 9);
    key.extend_from_slice(region.as_bytes());
    key.push(0);
    key.extend_from_slice(&effective_from.timestamp_millis().to_be_bytes());
    key
}

fn region_prefix(region: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(region.len() + 1);
    prefix.extend_from_slice(region.as_bytes());
    prefix.push(0);
    prefix
}

impl Store {
    /// Append a tariff row and advance the current pointer when this row
    /// is the newest for its region.
    pub async fn insert_tariff(&self, tariff: &Tariff) -> Result<(), StoreError> {
        let _permit = self.write_permit().await?;
        let value = serde_json::to_vec(tariff)?;
        self.tariffs
            .insert(history_key(&tariff.region, tariff.effective_from), value.clone())?;

        let newest = self
            .current_tariff(&tariff.region)?
            .is_none_or(|current| tariff.effective_from >= current.effective_from);
        if newest {
            self.tariff_current.insert(tariff.region.as_bytes(), value)?;
        }
        Ok(())
    }

    /// Current tariff = the row with the greatest `effective_from`.
    pub fn current_tariff(&self, region: &str) -> Result<Option<Tariff>, StoreError> {
        Ok(self
            .tariff_current
            .get(region.as_bytes())?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()?)
    }

    /// Most recent `limit` rows for a region, newest first.
    pub fn tariff_history(&self, region: &str, limit: usize) -> Result<Vec<Tariff>, StoreError> {
        let mut rows = Vec::with_capacity(limit.min(64));
        for item in self.tariffs.scan_prefix(region_prefix(region)).rev() {
            if rows.len() >= limit {
                break;
            }
            let (_key, raw) = item?;
            rows.push(serde_json::from_slice(&raw)?);
        }
        Ok(rows)
    }

    /// Current tariff for every region that has one.
    pub fn all_current_tariffs(&self) -> Result<Vec<Tariff>, StoreError> {
        let mut rows = Vec::new();
        for item in self.tariff_current.iter() {
            let (_key, raw) = item?;
            rows.push(serde_json::from_slice(&raw)?);
        }
        Ok(rows)
    }
}
