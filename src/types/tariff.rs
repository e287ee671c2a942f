//! Tariff types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who caused a tariff change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggeredBy {
    Auto,
    Manual,
}

/// Persisted tariff row. The current tariff for a region is the row with
/// the greatest `effective_from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tariff {
    pub tariff_id: Uuid,
    pub region: String,
    pub price_per_kwh: f64,
    pub effective_from: DateTime<Utc>,
    pub reason: String,
    pub triggered_by: TriggeredBy,
}

/// Change event published on `tariff_updates`, keyed by region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TariffUpdate {
    pub tariff_id: Uuid,
    pub region: String,
    pub price_per_kwh: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_percentage: Option<f64>,
    pub reason: String,
    pub triggered_by: TriggeredBy,
    pub effective_from: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggered_by_serializes_uppercase() {
        assert_eq!(
            serde_json::to_value(TriggeredBy::Manual).unwrap(),
            serde_json::json!("MANUAL")
        );
    }

    #[test]
    fn tariff_update_wire_shape() {
        let update = TariffUpdate {
            tariff_id: Uuid::new_v4(),
            region: "Pune-West".to_string(),
            price_per_kwh: 6.25,
            previous_price: Some(5.0),
            load_percentage: Some(92.0),
            reason: "load tier change".to_string(),
            triggered_by: TriggeredBy::Auto,
            effective_from: Utc::now(),
        };
        let v = serde_json::to_value(&update).unwrap();
        assert_eq!(v["pricePerKwh"], 6.25);
        assert_eq!(v["triggeredBy"], "AUTO");
    }
}
