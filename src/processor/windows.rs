//! In-memory aggregation windows.
//!
//! Buckets are integer window starts (Unix seconds, floor-aligned), kept
//! in a BTreeMap so flush selection walks them in order. The live loop
//! never writes to a bucket older than `current_bucket(now)`; late
//! readings for a bucket that already flushed out of memory are dropped,
//! which keeps flushes idempotent under at-least-once redelivery.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone, Utc};

use crate::config::CapacityTable;
use crate::types::{MeterAggregate, Reading, RegionalAggregate};

/// Accumulator for one `(bucket, meter)` pair.
#[derive(Debug, Clone, Default)]
pub struct PerMeterWindow {
    pub region: String,
    pub power_sum: f64,
    pub max_power: f64,
    pub energy_sum: f64,
    pub generation_sum: f64,
    /// At least one reading in this window carried `generation_kw`.
    pub generation_seen: bool,
    pub count: u64,
}

impl PerMeterWindow {
    fn observe(&mut self, reading: &Reading) {
        self.region.clone_from(&reading.region);
        self.power_sum += reading.power_kw;
        self.max_power = self.max_power.max(reading.power_kw);
        self.energy_sum += reading.energy_kwh.unwrap_or(0.0);
        if let Some(generation) = reading.generation_kw {
            self.generation_sum += generation;
            self.generation_seen = true;
        }
        self.count += 1;
    }

    fn avg_power(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.power_sum / self.count as f64
        }
    }

    fn avg_generation(&self) -> Option<f64> {
        (self.generation_seen && self.count > 0).then(|| self.generation_sum / self.count as f64)
    }
}

/// All open buckets for one window length.
#[derive(Debug)]
pub struct WindowSet {
    window_secs: i64,
    buckets: BTreeMap<i64, HashMap<String, PerMeterWindow>>,
}

/// Outcome of feeding one reading into a window set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Accepted,
    /// The reading's bucket already flushed out of memory.
    LateDropped,
}

impl WindowSet {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs,
            buckets: BTreeMap::new(),
        }
    }

    pub fn current_bucket(&self, now: DateTime<Utc>) -> i64 {
        let ts = now.timestamp();
        ts - ts.rem_euclid(self.window_secs)
    }

    /// Add a reading to its bucket.
    ///
    /// An old bucket still resident in memory (flush pending or failed)
    /// accepts late readings; one that has been flushed away does not.
    pub fn observe(&mut self, reading: &Reading, now: DateTime<Utc>) -> Observed {
        let bucket = reading.bucket_start(self.window_secs);
        if bucket < self.current_bucket(now) && !self.buckets.contains_key(&bucket) {
            return Observed::LateDropped;
        }
        self.buckets
            .entry(bucket)
            .or_default()
            .entry(reading.meter_id.clone())
            .or_default()
            .observe(reading);
        Observed::Accepted
    }

    /// Build aggregates for every bucket strictly older than
    /// `current_bucket(now)` without removing anything. The caller
    /// discards the returned keys only after the durable write succeeds.
    pub fn flushable(&self, now: DateTime<Utc>) -> (Vec<i64>, Vec<MeterAggregate>) {
        let cutoff = self.current_bucket(now);
        let mut keys = Vec::new();
        let mut aggregates = Vec::new();
        for (&bucket, meters) in self.buckets.range(..cutoff) {
            keys.push(bucket);
            let window_start = Utc
                .timestamp_opt(bucket, 0)
                .single()
                .unwrap_or_else(Utc::now);
            for (meter_id, window) in meters {
                aggregates.push(MeterAggregate {
                    meter_id: meter_id.clone(),
                    region: window.region.clone(),
                    window_start,
                    avg_power_kw: window.avg_power(),
                    max_power_kw: window.max_power,
                    energy_kwh_sum: window.energy_sum,
                    avg_generation_kw: window.avg_generation(),
                    count: window.count,
                });
            }
        }
        (keys, aggregates)
    }

    /// Drop flushed buckets.
    pub fn discard(&mut self, keys: &[i64]) {
        for key in keys {
            self.buckets.remove(key);
        }
    }

    /// Open bucket count (observability and the flush-freshness check).
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// True when a bucket older than `current_bucket(now)` is still open.
    pub fn has_stale_buckets(&self, now: DateTime<Utc>) -> bool {
        self.buckets
            .keys()
            .next()
            .is_some_and(|&oldest| oldest < self.current_bucket(now))
    }
}

/// Derive one regional rollup per `(window, region)` from per-meter
/// aggregates. `total_power_kw` sums per-meter averages;
/// `generation_percentage` is local feed-in as a share of that total,
/// present only when some meter in the window reported generation.
pub fn regionalize(
    aggregates: &[MeterAggregate],
    capacity: &CapacityTable,
) -> Vec<RegionalAggregate> {
    let mut grouped: BTreeMap<(i64, &str), Vec<&MeterAggregate>> = BTreeMap::new();
    for agg in aggregates {
        grouped
            .entry((agg.window_start.timestamp(), agg.region.as_str()))
            .or_default()
            .push(agg);
    }

    grouped
        .into_iter()
        .map(|((_, region), members)| {
            let total: f64 = members.iter().map(|a| a.avg_power_kw).sum();
            let max = members
                .iter()
                .map(|a| a.avg_power_kw)
                .fold(f64::MIN, f64::max);
            let min = members
                .iter()
                .map(|a| a.avg_power_kw)
                .fold(f64::MAX, f64::min);
            let mut active_meter_ids: Vec<String> =
                members.iter().map(|a| a.meter_id.clone()).collect();
            active_meter_ids.sort();
            let generating: Vec<f64> = members
                .iter()
                .filter_map(|a| a.avg_generation_kw)
                .collect();
            let generation_percentage = (!generating.is_empty() && total > 0.0)
                .then(|| generating.iter().sum::<f64>() / total * 100.0);
            RegionalAggregate {
                region: region.to_string(),
                window_start: members[0].window_start,
                meter_count: members.len(),
                total_power_kw: total,
                max_power_kw: max,
                min_power_kw: min,
                active_meter_ids,
                load_percentage: total / capacity.capacity_kw(region) * 100.0,
                generation_percentage,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(meter: &str, ts: &str, power: f64) -> Reading {
        Reading {
            reading_id: None,
            meter_id: meter.to_string(),
            region: "Pune-West".to_string(),
            timestamp: ts.parse().unwrap(),
            power_kw: power,
            voltage: None,
            current: None,
            frequency: None,
            power_factor: None,
            energy_kwh: Some(power / 60.0),
            generation_kw: None,
            seq: None,
            status: None,
        }
    }

    #[test]
    fn six_readings_aggregate_to_spec_example() {
        let mut windows = WindowSet::new(60);
        let now: DateTime<Utc> = "2025-11-07T10:00:30Z".parse().unwrap();
        for (i, power) in [2.0, 3.0, 4.0, 5.0, 6.0, 1.0].into_iter().enumerate() {
            let r = reading("MTR-1", &format!("2025-11-07T10:00:{:02}Z", i * 10), power);
            assert_eq!(windows.observe(&r, now), Observed::Accepted);
        }

        let later: DateTime<Utc> = "2025-11-07T10:01:05Z".parse().unwrap();
        let (keys, aggs) = windows.flushable(later);
        assert_eq!(keys.len(), 1);
        assert_eq!(aggs.len(), 1);
        let agg = &aggs[0];
        assert!((agg.avg_power_kw - 3.5).abs() < 1e-9);
        assert!((agg.max_power_kw - 6.0).abs() < 1e-9);
        assert_eq!(agg.count, 6);
        // Conservation: sum of inputs equals avg × count.
        assert!((agg.avg_power_kw * agg.count as f64 - 21.0).abs() < 1e-9);
    }

    #[test]
    fn flushable_leaves_current_bucket_open() {
        let mut windows = WindowSet::new(60);
        let now: DateTime<Utc> = "2025-11-07T10:01:05Z".parse().unwrap();
        windows.observe(&reading("MTR-1", "2025-11-07T10:00:10Z", 2.0), now);
        windows.observe(&reading("MTR-1", "2025-11-07T10:01:02Z", 3.0), now);

        let (keys, aggs) = windows.flushable(now);
        assert_eq!(keys.len(), 1);
        assert_eq!(aggs.len(), 1);
        windows.discard(&keys);
        assert_eq!(windows.open_buckets(), 1);
        assert!(!windows.has_stale_buckets(now));
    }

    #[test]
    fn late_reading_for_flushed_bucket_is_dropped() {
        let mut windows = WindowSet::new(60);
        let now: DateTime<Utc> = "2025-11-07T10:02:00Z".parse().unwrap();
        // Bucket 10:00 was never opened (already flushed away in this
        // scenario), so a late arrival must be rejected.
        let late = reading("MTR-1", "2025-11-07T10:00:59Z", 2.0);
        assert_eq!(windows.observe(&late, now), Observed::LateDropped);
    }

    #[test]
    fn late_reading_for_resident_bucket_is_accepted() {
        let mut windows = WindowSet::new(60);
        let earlier: DateTime<Utc> = "2025-11-07T10:00:30Z".parse().unwrap();
        windows.observe(&reading("MTR-1", "2025-11-07T10:00:10Z", 2.0), earlier);

        // The bucket is old now but still in memory (flush pending).
        let now: DateTime<Utc> = "2025-11-07T10:01:10Z".parse().unwrap();
        let late = reading("MTR-1", "2025-11-07T10:00:50Z", 4.0);
        assert_eq!(windows.observe(&late, now), Observed::Accepted);

        let (_, aggs) = windows.flushable(now);
        assert_eq!(aggs[0].count, 2);
    }

    #[test]
    fn regionalize_sums_per_meter_averages() {
        let capacity = CapacityTable::default();
        let window_start: DateTime<Utc> = "2025-11-07T10:00:00Z".parse().unwrap();
        let agg = |meter: &str, avg: f64| MeterAggregate {
            meter_id: meter.to_string(),
            region: "Pune-West".to_string(),
            window_start,
            avg_power_kw: avg,
            max_power_kw: avg,
            energy_kwh_sum: 0.0,
            avg_generation_kw: None,
            count: 1,
        };
        let regions = regionalize(&[agg("MTR-1", 10.0), agg("MTR-2", 30.0)], &capacity);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!(r.meter_count, 2);
        assert!((r.total_power_kw - 40.0).abs() < 1e-9);
        assert!((r.max_power_kw - 30.0).abs() < 1e-9);
        assert!((r.min_power_kw - 10.0).abs() < 1e-9);
        // 40 kW over 50 000 kW capacity = 0.08 %.
        assert!((r.load_percentage - 0.08).abs() < 1e-9);
        assert_eq!(r.active_meter_ids, vec!["MTR-1", "MTR-2"]);
        // No meter reported feed-in, so the generation share is absent.
        assert_eq!(r.generation_percentage, None);
    }

    #[test]
    fn generation_rolls_up_as_share_of_load() {
        let capacity = CapacityTable::default();
        let window_start: DateTime<Utc> = "2025-11-07T10:00:00Z".parse().unwrap();
        let agg = |meter: &str, avg: f64, generation: Option<f64>| MeterAggregate {
            meter_id: meter.to_string(),
            region: "Pune-West".to_string(),
            window_start,
            avg_power_kw: avg,
            max_power_kw: avg,
            energy_kwh_sum: 0.0,
            avg_generation_kw: generation,
            count: 1,
        };
        let regions = regionalize(
            &[
                agg("MTR-1", 10.0, Some(4.0)),
                agg("MTR-2", 30.0, None),
                agg("MTR-3", 10.0, Some(6.0)),
            ],
            &capacity,
        );
        // 10 kW of feed-in against 50 kW of load.
        let share = regions[0].generation_percentage.unwrap();
        assert!((share - 20.0).abs() < 1e-9);
    }

    #[test]
    fn generation_accumulates_per_window() {
        let mut windows = WindowSet::new(60);
        let now: DateTime<Utc> = "2025-11-07T10:00:30Z".parse().unwrap();
        let mut solar = reading("MTR-1", "2025-11-07T10:00:10Z", 2.0);
        solar.generation_kw = Some(1.0);
        windows.observe(&solar, now);
        let mut solar = reading("MTR-1", "2025-11-07T10:00:20Z", 2.0);
        solar.generation_kw = Some(3.0);
        windows.observe(&solar, now);

        let later: DateTime<Utc> = "2025-11-07T10:01:05Z".parse().unwrap();
        let (_, aggs) = windows.flushable(later);
        assert_eq!(aggs[0].avg_generation_kw, Some(2.0));
    }

    #[test]
    fn unknown_region_defaults_to_one_gigawatt() {
        let capacity = CapacityTable::default();
        let window_start: DateTime<Utc> = "2025-11-07T10:00:00Z".parse().unwrap();
        let regions = regionalize(
            &[MeterAggregate {
                meter_id: "MTR-1".to_string(),
                region: "Atlantis".to_string(),
                window_start,
                avg_power_kw: 10_000.0,
                max_power_kw: 10_000.0,
                energy_kwh_sum: 0.0,
                avg_generation_kw: None,
                count: 1,
            }],
            &capacity,
        );
        assert!((regions[0].load_percentage - 1.0).abs() < 1e-9);
    }
}
