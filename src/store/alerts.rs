//! Alert rows: time-ordered tree plus an id index for point lookups.

use uuid::Uuid;

use crate::types::{Alert, AlertStatus};

use super::{Store, StoreError};

/// Primary key `timestamp_millis_be ++ id`; reverse iteration yields
/// newest alerts first.
fn time_key(alert: &Alert) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&alert.timestamp.timestamp_millis().to_be_bytes());
    key.extend_from_slice(alert.id.as_bytes());
    key
}

impl Store {
    pub async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let _permit = self.write_permit().await?;
        let key = time_key(alert);
        self.alerts.insert(&key, serde_json::to_vec(alert)?)?;
        self.alerts_by_id.insert(alert.id.as_bytes(), key)?;
        Ok(())
    }

    pub fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, StoreError> {
        let Some(key) = self.alerts_by_id.get(id.as_bytes())? else {
            return Ok(None);
        };
        Ok(self
            .alerts
            .get(key)?
            .map(|raw| serde_json::from_slice(&raw))
            .transpose()?)
    }

    /// Replace an alert row in place (status transitions keep the original
    /// timestamp, so the time key is stable).
    pub async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let _permit = self.write_permit().await?;
        self.alerts.insert(time_key(alert), serde_json::to_vec(alert)?)?;
        Ok(())
    }

    /// Most recent alerts still in `active` status, newest first.
    pub fn active_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let mut rows = Vec::new();
        for item in self.alerts.iter().rev() {
            if rows.len() >= limit {
                break;
            }
            let (_key, raw) = item?;
            let alert: Alert = serde_json::from_slice(&raw)?;
            if alert.status == AlertStatus::Active {
                rows.push(alert);
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;
    use crate::types::Severity;
    use chrono::Utc;
    use std::collections::HashMap;

    fn alert(alert_type: &str) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            alert_type: alert_type.to_string(),
            severity: Severity::High,
            region: Some("Pune-West".to_string()),
            meter_id: Some("MTR-1".to_string()),
            message: "test alert".to_string(),
            status: AlertStatus::Active,
            timestamp: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_point_lookup() {
        let (_dir, store) = test_store();
        let a = alert("ANOMALY");
        store.insert_alert(&a).await.unwrap();
        let got = store.get_alert(a.id).unwrap().unwrap();
        assert_eq!(got.alert_type, "ANOMALY");
        assert!(store.get_alert(Uuid::new_v4()).unwrap().is_none());
    }

    #[tokio::test]
    async fn update_preserves_identity() {
        let (_dir, store) = test_store();
        let mut a = alert("regional_overload");
        store.insert_alert(&a).await.unwrap();

        a.status = AlertStatus::Acknowledged;
        a.acknowledged_by = Some("op-7".to_string());
        store.update_alert(&a).await.unwrap();

        let got = store.get_alert(a.id).unwrap().unwrap();
        assert_eq!(got.status, AlertStatus::Acknowledged);
        assert_eq!(got.acknowledged_by.as_deref(), Some("op-7"));
    }

    #[tokio::test]
    async fn active_alerts_excludes_resolved() {
        let (_dir, store) = test_store();
        let keep = alert("meter_outage");
        let mut gone = alert("meter_outage");
        store.insert_alert(&keep).await.unwrap();
        store.insert_alert(&gone).await.unwrap();

        gone.status = AlertStatus::Resolved;
        store.update_alert(&gone).await.unwrap();

        let active = store.active_alerts(10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);
    }
}
