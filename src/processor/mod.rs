//! Stream processor: windowed aggregation + anomaly detection.
//!
//! One consumer loop owns all mutable state (window maps, baselines); the
//! flush timers run on the same task via `select!`, so flushes always see
//! a consistent snapshot. Failure semantics:
//! - flush failure → buckets retained, retried next tick
//! - publish failure → counter bump, no retry from memory (the durable
//!   upsert already happened)
//! - consumer restart → resume from the committed offset; duplicates are
//!   absorbed by upserts and the bucket-already-flushed check

mod anomaly;
mod windows;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{topics, Bus, Record};
use crate::cache::Cache;
use crate::config::defaults::OVERLOAD_LOAD_PERCENTAGE;
use crate::config::{AppConfig, CapacityTable};
use crate::metrics::Metrics;
use crate::store::Store;
use crate::types::Reading;

pub use anomaly::AnomalyDetector;
pub use windows::{regionalize, Observed, PerMeterWindow, WindowSet};

/// Consumer group name on `raw_readings`.
const CONSUMER_GROUP: &str = "stream-processor";

/// Throttle applied between readings while the store is refusing flushes.
const DEGRADED_PAUSE: Duration = Duration::from_millis(100);

pub struct StreamProcessor {
    bus: Arc<Bus>,
    store: Store,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
    capacity: CapacityTable,
    flush_interval_1m: Duration,
    flush_interval_15m: Duration,
    windows_1m: WindowSet,
    windows_15m: WindowSet,
    detector: AnomalyDetector,
    /// Set after a failed flush; pauses consumption until a flush succeeds.
    degraded: bool,
}

impl StreamProcessor {
    pub fn new(
        bus: Arc<Bus>,
        store: Store,
        cache: Arc<Cache>,
        metrics: Arc<Metrics>,
        config: &AppConfig,
    ) -> Self {
        Self {
            bus,
            store,
            cache,
            metrics,
            capacity: config.capacity.clone(),
            flush_interval_1m: Duration::from_secs(config.flush_interval_1m_secs),
            flush_interval_15m: Duration::from_secs(config.flush_interval_15m_secs),
            windows_1m: WindowSet::new(60),
            windows_15m: WindowSet::new(900),
            detector: AnomalyDetector::new(),
            degraded: false,
        }
    }

    /// Run until cancellation. Performs a final drain-flush on the way out.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut consumer = self.bus.subscribe(topics::RAW_READINGS, CONSUMER_GROUP);
        let mut tick_1m = tokio::time::interval(self.flush_interval_1m);
        let mut tick_15m = tokio::time::interval(self.flush_interval_15m);
        tick_1m.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick_15m.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first real flush happens one window from now.
        tick_1m.reset();
        tick_15m.reset();

        info!("[StreamProcessor] Consuming {} as group {CONSUMER_GROUP}", topics::RAW_READINGS);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[StreamProcessor] Shutdown signal received");
                    break;
                }
                record = consumer.recv() => {
                    match record {
                        Ok(record) => {
                            self.handle_record(&record);
                            if self.degraded {
                                tokio::time::sleep(DEGRADED_PAUSE).await;
                            }
                        }
                        Err(e) => {
                            warn!("[StreamProcessor] Consumer error: {e}");
                            break;
                        }
                    }
                }
                _ = tick_1m.tick() => self.flush_1m().await,
                _ = tick_15m.tick() => self.flush_15m().await,
            }
        }

        // Final flush: drain every open bucket, current ones included.
        self.final_flush().await;
        consumer.commit();
    }

    // ------------------------------------------------------------------
    // Readings
    // ------------------------------------------------------------------

    fn handle_record(&mut self, record: &Record) {
        let reading: Reading = match record.json() {
            Ok(reading) => reading,
            Err(e) => {
                debug!("[StreamProcessor] Dropping undecodable record at {}/{}: {e}",
                    record.partition, record.offset);
                return;
            }
        };
        self.metrics.readings_consumed.inc();

        let now = Utc::now();
        if self.windows_1m.observe(&reading, now) == Observed::LateDropped {
            self.metrics.readings_late_dropped.inc();
        }
        self.windows_15m.observe(&reading, now);

        let store = &self.store;
        let meter_id = reading.meter_id.clone();
        if let Some(event) = self.detector.assess(&reading, || {
            store.last_avg_power_for_meter(&meter_id).ok().flatten()
        }) {
            self.metrics.anomalies_detected.inc();
            if let Err(e) = self
                .bus
                .publish_json(topics::ALERTS, &event.meter_id, &event)
            {
                self.metrics.bus_publish_failures.inc();
                warn!("[StreamProcessor] Anomaly publish failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    async fn flush_1m(&mut self) {
        let now = Utc::now();
        let (keys, aggregates) = self.windows_1m.flushable(now);
        if keys.is_empty() {
            return;
        }

        if let Err(e) = self.store.upsert_aggregates_1m(&aggregates).await {
            self.metrics.flush_failures.inc();
            self.degraded = true;
            warn!(
                "[StreamProcessor] 1m flush failed ({} buckets retained, pool {:?}): {e}",
                keys.len(),
                self.store.pool_stats()
            );
            return;
        }
        self.degraded = false;
        self.metrics.aggregates_written.add(aggregates.len() as u64);

        for agg in &aggregates {
            if let Err(e) = self
                .bus
                .publish_json(topics::AGGREGATES_1M, &agg.meter_id, agg)
            {
                self.metrics.bus_publish_failures.inc();
                debug!("[StreamProcessor] Aggregate publish failed: {e}");
            }
        }

        // Regional rollups ride the 1-minute flush.
        for regional in regionalize(&aggregates, &self.capacity) {
            if let Err(e) =
                self.bus
                    .publish_json(topics::AGGREGATES_1M_REGIONAL, &regional.region, &regional)
            {
                self.metrics.bus_publish_failures.inc();
                debug!("[StreamProcessor] Regional publish failed: {e}");
            }
            if let Err(e) = self
                .cache
                .update_region_load(&regional.region, regional.load_percentage)
            {
                debug!("[StreamProcessor] Region load cache update failed: {e}");
            }
            if regional.load_percentage >= OVERLOAD_LOAD_PERCENTAGE {
                if let Err(e) = self
                    .cache
                    .record_overload_minute(&regional.region, regional.window_start.timestamp())
                {
                    debug!("[StreamProcessor] Overload window update failed: {e}");
                }
            }
        }

        self.windows_1m.discard(&keys);
        self.metrics.flushes_1m.inc();
        debug!(
            "[StreamProcessor] Flushed {} 1m buckets ({} aggregates)",
            keys.len(),
            aggregates.len()
        );
    }

    async fn flush_15m(&mut self) {
        let now = Utc::now();
        let (keys, aggregates) = self.windows_15m.flushable(now);
        if keys.is_empty() {
            return;
        }

        if let Err(e) = self.store.upsert_aggregates_15m(&aggregates).await {
            self.metrics.flush_failures.inc();
            self.degraded = true;
            warn!(
                "[StreamProcessor] 15m flush failed ({} buckets retained, pool {:?}): {e}",
                keys.len(),
                self.store.pool_stats()
            );
            return;
        }
        self.degraded = false;
        self.metrics.aggregates_written.add(aggregates.len() as u64);

        for agg in &aggregates {
            if let Err(e) = self
                .bus
                .publish_json(topics::AGGREGATES_15M, &agg.meter_id, agg)
            {
                self.metrics.bus_publish_failures.inc();
                debug!("[StreamProcessor] 15m aggregate publish failed: {e}");
            }
        }

        self.windows_15m.discard(&keys);
        self.metrics.flushes_15m.inc();
    }

    /// Shutdown drain: flush everything still open, partial current
    /// buckets included. Upsert-by-key means a restart that re-aggregates
    /// the same windows simply replaces these rows.
    async fn final_flush(&mut self) {
        let horizon = Utc::now() + chrono::Duration::days(1);

        let (keys, aggregates) = self.windows_1m.flushable(horizon);
        if !keys.is_empty() {
            match self.store.upsert_aggregates_1m(&aggregates).await {
                Ok(()) => {
                    self.windows_1m.discard(&keys);
                    info!("[StreamProcessor] Final flush wrote {} 1m aggregates", aggregates.len());
                }
                Err(e) => warn!("[StreamProcessor] Final 1m flush failed: {e}"),
            }
        }

        let (keys, aggregates) = self.windows_15m.flushable(horizon);
        if !keys.is_empty() {
            match self.store.upsert_aggregates_15m(&aggregates).await {
                Ok(()) => {
                    self.windows_15m.discard(&keys);
                    info!("[StreamProcessor] Final flush wrote {} 15m aggregates", aggregates.len());
                }
                Err(e) => warn!("[StreamProcessor] Final 15m flush failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn test_processor() -> (tempfile::TempDir, StreamProcessor, Arc<Bus>, Arc<Cache>) {
        let (dir, store) = test_store();
        let bus = Arc::new(Bus::new(4, 10_000));
        let cache = Arc::new(Cache::new());
        let metrics = Arc::new(Metrics::new());
        let config = AppConfig::from_env();
        let processor = StreamProcessor::new(
            Arc::clone(&bus),
            store,
            Arc::clone(&cache),
            metrics,
            &config,
        );
        (dir, processor, bus, cache)
    }

    fn record_for(reading: &Reading) -> Record {
        Record {
            topic: topics::RAW_READINGS.to_string(),
            partition: 0,
            offset: 0,
            key: reading.meter_id.clone(),
            payload: serde_json::to_vec(reading).unwrap(),
            headers: Default::default(),
            timestamp: Utc::now(),
        }
    }

    fn reading(meter: &str, power: f64) -> Reading {
        Reading {
            reading_id: None,
            meter_id: meter.to_string(),
            region: "Pune-West".to_string(),
            timestamp: Utc::now(),
            power_kw: power,
            voltage: None,
            current: None,
            frequency: None,
            power_factor: None,
            energy_kwh: Some(0.1),
            generation_kw: None,
            seq: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn readings_open_windows_in_both_sets() {
        let (_dir, mut processor, _bus, _cache) = test_processor();
        processor.handle_record(&record_for(&reading("MTR-1", 2.0)));
        assert_eq!(processor.windows_1m.open_buckets(), 1);
        assert_eq!(processor.windows_15m.open_buckets(), 1);
        assert_eq!(processor.metrics.readings_consumed.get(), 1);
    }

    #[tokio::test]
    async fn spike_publishes_anomaly_event() {
        let (_dir, mut processor, bus, _cache) = test_processor();
        let mut consumer = bus.subscribe(topics::ALERTS, "test");
        for _ in 0..10 {
            processor.handle_record(&record_for(&reading("MTR-1", 2.0)));
        }
        processor.handle_record(&record_for(&reading("MTR-1", 5.0)));
        assert_eq!(processor.metrics.anomalies_detected.get(), 1);

        let event: crate::types::AnomalyEvent = consumer.recv().await.unwrap().json().unwrap();
        assert_eq!(event.meter_id, "MTR-1");
        assert_eq!(event.severity, crate::types::Severity::Medium);
    }

    #[tokio::test]
    async fn final_flush_drains_current_buckets() {
        let (_dir, mut processor, _bus, _cache) = test_processor();
        let r = reading("MTR-1", 2.0);
        processor.handle_record(&record_for(&r));
        processor.final_flush().await;
        assert_eq!(processor.windows_1m.open_buckets(), 0);
        assert_eq!(processor.windows_15m.open_buckets(), 0);

        let window = r.bucket_start(60);
        let stored = processor
            .store
            .aggregate_1m(
                "MTR-1",
                chrono::TimeZone::timestamp_opt(&Utc, window, 0).single().unwrap(),
            )
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn undecodable_record_is_skipped() {
        let (_dir, mut processor, _bus, _cache) = test_processor();
        let record = Record {
            topic: topics::RAW_READINGS.to_string(),
            partition: 0,
            offset: 0,
            key: "k".to_string(),
            payload: b"not json".to_vec(),
            headers: Default::default(),
            timestamp: Utc::now(),
        };
        processor.handle_record(&record);
        assert_eq!(processor.metrics.readings_consumed.get(), 0);
    }
}
