//! Upstream topic consumers → channel broadcast.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{topics, Bus, Record};
use crate::types::{Alert, AlertStatusUpdate, TariffUpdate};

use super::channels::Channel;
use super::hub::Hub;

/// Consumer group prefix; one loop per upstream topic.
const CONSUMER_GROUP: &str = "notifier";

/// Channels a tariff update fans out to.
pub fn tariff_channels(update: &TariffUpdate) -> Vec<Channel> {
    vec![Channel::Tariffs, Channel::Region(update.region.clone())]
}

/// Channels a processed alert fans out to.
pub fn alert_channels(alert: &Alert) -> Vec<Channel> {
    let mut channels = vec![Channel::Alerts];
    if let Some(region) = &alert.region {
        channels.push(Channel::Region(region.clone()));
    }
    if let Some(meter) = &alert.meter_id {
        channels.push(Channel::Meter(meter.clone()));
    }
    channels
}

/// Channels a status update fans out to.
pub fn status_channels(update: &AlertStatusUpdate) -> Vec<Channel> {
    let mut channels = vec![Channel::AlertStatusUpdates];
    if let Some(region) = &update.region {
        channels.push(Channel::Region(region.clone()));
    }
    if let Some(meter) = &update.meter_id {
        channels.push(Channel::Meter(meter.clone()));
    }
    channels
}

/// Run one consumer loop per upstream topic until cancellation.
pub async fn run(bus: Arc<Bus>, hub: Arc<Hub>, cancel: CancellationToken) {
    let mut tariffs = bus.subscribe(topics::TARIFF_UPDATES, CONSUMER_GROUP);
    let mut alerts = bus.subscribe(topics::ALERTS_PROCESSED, CONSUMER_GROUP);
    let mut statuses = bus.subscribe(topics::ALERT_STATUS_UPDATES, CONSUMER_GROUP);

    info!(
        "[Notifier] Fan-out consuming {}, {}, {}",
        topics::TARIFF_UPDATES,
        topics::ALERTS_PROCESSED,
        topics::ALERT_STATUS_UPDATES
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Notifier] Fan-out shutdown signal received");
                break;
            }
            record = tariffs.recv() => match record {
                Ok(record) => fan_out_tariff(&hub, &record),
                Err(e) => { warn!("[Notifier] Consumer error: {e}"); break; }
            },
            record = alerts.recv() => match record {
                Ok(record) => fan_out_alert(&hub, &record),
                Err(e) => { warn!("[Notifier] Consumer error: {e}"); break; }
            },
            record = statuses.recv() => match record {
                Ok(record) => fan_out_status(&hub, &record),
                Err(e) => { warn!("[Notifier] Consumer error: {e}"); break; }
            },
        }
    }
}

fn fan_out_tariff(hub: &Hub, record: &Record) {
    match record.json::<TariffUpdate>() {
        Ok(update) => {
            let channels = tariff_channels(&update);
            match serde_json::to_value(&update) {
                Ok(payload) => hub.broadcast("TARIFF_UPDATE", &channels, &payload),
                Err(e) => debug!("[Notifier] Unserializable tariff update: {e}"),
            }
        }
        Err(e) => debug!("[Notifier] Undecodable tariff update: {e}"),
    }
}

fn fan_out_alert(hub: &Hub, record: &Record) {
    match record.json::<Alert>() {
        Ok(alert) => {
            let channels = alert_channels(&alert);
            match serde_json::to_value(&alert) {
                Ok(payload) => hub.broadcast("ALERT", &channels, &payload),
                Err(e) => debug!("[Notifier] Unserializable alert: {e}"),
            }
        }
        Err(e) => debug!("[Notifier] Undecodable alert: {e}"),
    }
}

fn fan_out_status(hub: &Hub, record: &Record) {
    match record.json::<AlertStatusUpdate>() {
        Ok(update) => {
            let channels = status_channels(&update);
            match serde_json::to_value(&update) {
                Ok(payload) => hub.broadcast("ALERT_STATUS_UPDATE", &channels, &payload),
                Err(e) => debug!("[Notifier] Unserializable status update: {e}"),
            }
        }
        Err(e) => debug!("[Notifier] Undecodable status update: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, Severity, TriggeredBy};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn tariff_updates_reach_tariffs_and_region() {
        let update = TariffUpdate {
            tariff_id: Uuid::new_v4(),
            region: "Pune-West".to_string(),
            price_per_kwh: 6.25,
            previous_price: None,
            load_percentage: Some(92.0),
            reason: "load".to_string(),
            triggered_by: TriggeredBy::Auto,
            effective_from: Utc::now(),
        };
        assert_eq!(
            tariff_channels(&update),
            vec![
                Channel::Tariffs,
                Channel::Region("Pune-West".to_string())
            ]
        );
    }

    #[test]
    fn alerts_reach_alerts_region_and_meter() {
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: "ANOMALY".to_string(),
            severity: Severity::High,
            region: Some("Pune-West".to_string()),
            meter_id: Some("MTR-1".to_string()),
            message: "m".to_string(),
            status: AlertStatus::Active,
            timestamp: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            metadata: Default::default(),
        };
        assert_eq!(
            alert_channels(&alert),
            vec![
                Channel::Alerts,
                Channel::Region("Pune-West".to_string()),
                Channel::Meter("MTR-1".to_string())
            ]
        );
    }

    #[test]
    fn region_free_status_update_stays_on_status_channel() {
        let update = AlertStatusUpdate {
            alert_id: Uuid::new_v4(),
            status: AlertStatus::Resolved,
            region: None,
            meter_id: None,
            acknowledged_by: None,
            timestamp: Utc::now(),
        };
        assert_eq!(status_channels(&update), vec![Channel::AlertStatusUpdates]);
    }
}
