//! Tariff engine: regional load → tiered pricing with hysteresis.
//!
//! Consumes `aggregates_1m_regional`, reprices per region, and suppresses
//! updates smaller than the hysteresis threshold so boundary oscillation
//! never floods `tariff_updates`. Operator overrides bypass hysteresis.
//! Every applied change does three things in one logical moment: insert a
//! tariff row, refresh `tariff:{region}`, publish a `tariff_updates`
//! message keyed by region.

mod api;
mod pricing;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{topics, Bus, Publisher};
use crate::cache::Cache;
use crate::config::defaults::{OVERRIDE_MAX_PRICE, OVERRIDE_MIN_PRICE, OVERRIDE_MIN_REASON_LEN};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::store::{Store, StoreError};
use crate::types::{RegionalAggregate, Tariff, TariffUpdate, TriggeredBy};

pub use api::router;
pub use pricing::{price_for_load, LoadTier};

/// Consumer group name on `aggregates_1m_regional`.
const CONSUMER_GROUP: &str = "tariff-engine";

/// Operator override request body.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub region: String,
    pub new_price: f64,
    pub reason: String,
    #[serde(default)]
    pub operator_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum TariffError {
    #[error("{0}")]
    Invalid(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct TariffInner {
    publisher: Publisher,
    store: Store,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
    base_price: f64,
    min_change: f64,
    operator_key: Option<String>,
    /// Last published price per region, seeded from the store on boot.
    last_price: RwLock<HashMap<String, f64>>,
}

/// Shared tariff engine handle (consumer loop + operator API).
#[derive(Clone)]
pub struct TariffEngine {
    inner: Arc<TariffInner>,
}

impl TariffEngine {
    pub fn new(
        bus: Arc<Bus>,
        store: Store,
        cache: Arc<Cache>,
        metrics: Arc<Metrics>,
        config: &AppConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TariffInner {
                publisher: Publisher::new(bus, Arc::clone(&metrics)),
                store,
                cache,
                metrics,
                base_price: config.base_price,
                min_change: config.min_change_threshold,
                operator_key: config.operator_key.clone(),
                last_price: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Load current tariffs from the store into the cache and the
    /// last-price table. Runs once at boot.
    pub async fn preload(&self) -> Result<usize, StoreError> {
        let current = self.inner.store.all_current_tariffs()?;
        let mut table = self.inner.last_price.write().await;
        for tariff in &current {
            table.insert(tariff.region.clone(), tariff.price_per_kwh);
            if let Err(e) = self
                .inner
                .cache
                .set_tariff(&tariff.region, tariff.price_per_kwh)
            {
                warn!("[TariffEngine] Cache preload failed for {}: {e}", tariff.region);
            }
        }
        Ok(current.len())
    }

    /// Consumer loop over regional aggregates.
    pub async fn run(self, cancel: CancellationToken) {
        let mut consumer = self
            .inner
            .publisher
            .bus()
            .subscribe(topics::AGGREGATES_1M_REGIONAL, CONSUMER_GROUP);
        info!(
            "[TariffEngine] Consuming {} as group {CONSUMER_GROUP} (base ₹{:.2})",
            topics::AGGREGATES_1M_REGIONAL,
            self.inner.base_price
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[TariffEngine] Shutdown signal received");
                    break;
                }
                record = consumer.recv() => {
                    match record {
                        Ok(record) => {
                            match record.json::<RegionalAggregate>() {
                                Ok(aggregate) => self.on_regional(&aggregate).await,
                                Err(e) => debug!("[TariffEngine] Undecodable regional aggregate: {e}"),
                            }
                        }
                        Err(e) => {
                            warn!("[TariffEngine] Consumer error: {e}");
                            break;
                        }
                    }
                }
            }
        }
        consumer.commit();
    }

    /// Reprice one region from a fresh load observation.
    async fn on_regional(&self, aggregate: &RegionalAggregate) {
        let (tier, new_price) =
            price_for_load(self.inner.base_price, aggregate.load_percentage);

        let last = {
            let table = self.inner.last_price.read().await;
            table
                .get(&aggregate.region)
                .copied()
                .unwrap_or(self.inner.base_price)
        };

        // Hysteresis: hold the line on sub-threshold moves.
        if (new_price - last).abs() < self.inner.min_change {
            self.inner.metrics.tariff_hysteresis_suppressed.inc();
            return;
        }

        let reason = format!(
            "Load {:.1}% ({} tier)",
            aggregate.load_percentage,
            tier.label()
        );
        if let Err(e) = self
            .apply_change(
                &aggregate.region,
                new_price,
                Some(last),
                Some(aggregate.load_percentage),
                reason,
                TriggeredBy::Auto,
            )
            .await
        {
            warn!("[TariffEngine] Repricing {} failed: {e}", aggregate.region);
        }
    }

    /// Validate and apply an operator override. Bypasses hysteresis.
    pub async fn apply_override(
        &self,
        request: &OverrideRequest,
    ) -> Result<TariffUpdate, TariffError> {
        if request.region.trim().is_empty() {
            return Err(TariffError::Invalid("region must be non-empty".into()));
        }
        if !(OVERRIDE_MIN_PRICE..=OVERRIDE_MAX_PRICE).contains(&request.new_price) {
            return Err(TariffError::Invalid(format!(
                "newPrice must be in [₹{OVERRIDE_MIN_PRICE:.2}, ₹{OVERRIDE_MAX_PRICE:.2}]"
            )));
        }
        if request.reason.trim().len() < OVERRIDE_MIN_REASON_LEN {
            return Err(TariffError::Invalid(format!(
                "reason must be at least {OVERRIDE_MIN_REASON_LEN} characters"
            )));
        }

        let previous = match self.inner.cache.tariff(&request.region) {
            Ok(Some(price)) => Some(price),
            _ => self
                .inner
                .store
                .current_tariff(&request.region)?
                .map(|t| t.price_per_kwh),
        };

        let reason = match &request.operator_id {
            Some(operator) => format!("{} (operator {operator})", request.reason.trim()),
            None => request.reason.trim().to_string(),
        };

        let update = self
            .apply_change(
                &request.region,
                request.new_price,
                previous,
                None,
                reason,
                TriggeredBy::Manual,
            )
            .await?;
        self.inner.metrics.tariff_overrides.inc();
        Ok(update)
    }

    /// Persist + cache + publish one tariff change.
    async fn apply_change(
        &self,
        region: &str,
        price: f64,
        previous: Option<f64>,
        load_percentage: Option<f64>,
        reason: String,
        triggered_by: TriggeredBy,
    ) -> Result<TariffUpdate, TariffError> {
        let tariff = Tariff {
            tariff_id: Uuid::new_v4(),
            region: region.to_string(),
            price_per_kwh: price,
            effective_from: Utc::now(),
            reason: reason.clone(),
            triggered_by,
        };
        self.inner.store.insert_tariff(&tariff).await?;

        if let Err(e) = self.inner.cache.set_tariff(region, price) {
            warn!("[TariffEngine] Tariff cache update failed for {region}: {e}");
        }
        self.inner
            .last_price
            .write()
            .await
            .insert(region.to_string(), price);

        let update = TariffUpdate {
            tariff_id: tariff.tariff_id,
            region: region.to_string(),
            price_per_kwh: price,
            previous_price: previous,
            load_percentage,
            reason,
            triggered_by,
            effective_from: tariff.effective_from,
        };
        if let Err(e) = self
            .inner
            .publisher
            .publish_json(topics::TARIFF_UPDATES, region, &update)
            .await
        {
            warn!("[TariffEngine] Tariff update publish failed for {region}: {e}");
        }
        self.inner.metrics.tariff_updates_published.inc();
        info!(
            "[TariffEngine] 💰 {region}: ₹{price:.2}/kWh ({triggered_by:?}): {}",
            update.reason
        );
        Ok(update)
    }

    fn store(&self) -> &Store {
        &self.inner.store
    }

    fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    fn operator_key(&self) -> Option<&str> {
        self.inner.operator_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    pub(super) fn test_engine() -> (tempfile::TempDir, TariffEngine, Arc<Bus>, Arc<Cache>) {
        let (dir, store) = test_store();
        let bus = Arc::new(Bus::new(4, 10_000));
        let cache = Arc::new(Cache::new());
        let metrics = Arc::new(Metrics::new());
        let config = AppConfig::from_env();
        let engine = TariffEngine::new(
            Arc::clone(&bus),
            store,
            Arc::clone(&cache),
            metrics,
            &config,
        );
        (dir, engine, bus, cache)
    }

    fn regional(load: f64) -> RegionalAggregate {
        RegionalAggregate {
            region: "Pune-West".to_string(),
            window_start: Utc::now(),
            meter_count: 10,
            total_power_kw: load * 500.0,
            max_power_kw: 100.0,
            min_power_kw: 1.0,
            active_meter_ids: vec![],
            load_percentage: load,
            generation_percentage: None,
        }
    }

    #[tokio::test]
    async fn critical_load_reprices_and_publishes() {
        let (_dir, engine, bus, cache) = test_engine();
        let mut consumer = bus.subscribe(topics::TARIFF_UPDATES, "test");

        engine.on_regional(&regional(92.0)).await;

        let update: TariffUpdate = consumer.recv().await.unwrap().json().unwrap();
        assert!((update.price_per_kwh - 6.25).abs() < 1e-9);
        assert_eq!(update.triggered_by, TriggeredBy::Auto);
        assert_eq!(cache.tariff("Pune-West").unwrap(), Some(6.25));

        let row = engine.store().current_tariff("Pune-West").unwrap().unwrap();
        assert!((row.price_per_kwh - 6.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hysteresis_suppresses_same_tier_wobble() {
        let (_dir, engine, bus, _cache) = test_engine();
        engine.on_regional(&regional(92.0)).await;
        // Still critical tier: identical price, difference 0 < ₹0.10.
        engine.on_regional(&regional(91.0)).await;

        assert_eq!(engine.inner.metrics.tariff_updates_published.get(), 1);
        assert_eq!(engine.inner.metrics.tariff_hysteresis_suppressed.get(), 1);
        assert_eq!(bus.depth(topics::TARIFF_UPDATES), 1);
    }

    #[tokio::test]
    async fn override_round_trip() {
        let (_dir, engine, bus, cache) = test_engine();
        let mut consumer = bus.subscribe(topics::TARIFF_UPDATES, "test");

        let update = engine
            .apply_override(&OverrideRequest {
                region: "Pune-West".to_string(),
                new_price: 7.5,
                reason: "planned maintenance surcharge".to_string(),
                operator_id: Some("op-7".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(update.triggered_by, TriggeredBy::Manual);

        // Same logical moment: cache, store row, and bus message agree.
        assert_eq!(cache.tariff("Pune-West").unwrap(), Some(7.5));
        let row = engine.store().current_tariff("Pune-West").unwrap().unwrap();
        assert_eq!(row.triggered_by, TriggeredBy::Manual);
        assert!((row.price_per_kwh - 7.5).abs() < 1e-9);
        let published: TariffUpdate = consumer.recv().await.unwrap().json().unwrap();
        assert!((published.price_per_kwh - 7.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn override_validation() {
        let (_dir, engine, _bus, _cache) = test_engine();
        let bad_price = engine
            .apply_override(&OverrideRequest {
                region: "Pune-West".to_string(),
                new_price: 45.0,
                reason: "way beyond the ceiling".to_string(),
                operator_id: None,
            })
            .await;
        assert!(matches!(bad_price, Err(TariffError::Invalid(_))));

        let short_reason = engine
            .apply_override(&OverrideRequest {
                region: "Pune-West".to_string(),
                new_price: 6.0,
                reason: "short".to_string(),
                operator_id: None,
            })
            .await;
        assert!(matches!(short_reason, Err(TariffError::Invalid(_))));
    }

    #[tokio::test]
    async fn override_bypasses_hysteresis() {
        let (_dir, engine, _bus, _cache) = test_engine();
        engine.on_regional(&regional(92.0)).await;
        // ₹6.25 → ₹6.30 is below the ₹0.10 threshold, but MANUAL goes through.
        engine
            .apply_override(&OverrideRequest {
                region: "Pune-West".to_string(),
                new_price: 6.30,
                reason: "operator fine adjustment".to_string(),
                operator_id: None,
            })
            .await
            .unwrap();
        assert_eq!(engine.inner.metrics.tariff_updates_published.get(), 2);
    }

    #[tokio::test]
    async fn preload_seeds_last_price_and_cache() {
        let (_dir, engine, _bus, cache) = test_engine();
        engine.on_regional(&regional(92.0)).await;

        // A second engine over the same store starts from the persisted state.
        let config = AppConfig::from_env();
        let engine2 = TariffEngine::new(
            Arc::clone(engine.inner.publisher.bus()),
            engine.store().clone(),
            Arc::new(Cache::new()),
            Arc::new(Metrics::new()),
            &config,
        );
        let loaded = engine2.preload().await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(
            engine2.inner.last_price.read().await.get("Pune-West"),
            Some(&6.25)
        );
        drop(cache);
    }
}
