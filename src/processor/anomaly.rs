//! Per-meter anomaly detection with adaptive baselines.
//!
//! Each meter carries a smoothed power baseline updated by exponential
//! moving average after every normal reading. Detection stays quiet for
//! the first ten samples, then classifies spikes, drops, and outages
//! relative to the baseline. Anomalous readings do not move the baseline,
//! so a sustained fault keeps alerting instead of becoming the new normal.

use std::collections::HashMap;

use crate::config::defaults::{
    ANOMALY_DROP_MEDIUM, ANOMALY_DROP_THRESHOLD, ANOMALY_MIN_SAMPLES, ANOMALY_OUTAGE_BASELINE_KW,
    ANOMALY_OUTAGE_POWER_KW, ANOMALY_SPIKE_HIGH, ANOMALY_SPIKE_THRESHOLD, BASELINE_EMA_ALPHA,
};
use crate::types::{AnomalyEvent, AnomalyKind, Reading, Severity};

#[derive(Debug, Default)]
struct MeterState {
    baseline: Option<f64>,
    count: u64,
}

/// Detector state for all meters on this processor's partitions.
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    meters: HashMap<String, MeterState>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assess one reading. `stored_baseline` resolves the cold-start
    /// baseline from the time-series store and is only invoked when the
    /// in-memory baseline is absent.
    pub fn assess(
        &mut self,
        reading: &Reading,
        stored_baseline: impl FnOnce() -> Option<f64>,
    ) -> Option<AnomalyEvent> {
        let state = self.meters.entry(reading.meter_id.clone()).or_default();
        state.count += 1;

        let baseline = match state.baseline {
            Some(b) => b,
            None => match stored_baseline() {
                Some(b) => {
                    state.baseline = Some(b);
                    b
                }
                None => {
                    // First contact with this meter anywhere: adopt the
                    // sample as the baseline and stay quiet.
                    state.baseline = Some(reading.power_kw);
                    return None;
                }
            },
        };

        // Samples 1..=10 are warmup: the baseline tracks but detection
        // stays quiet until sample 11.
        if state.count <= ANOMALY_MIN_SAMPLES {
            state.baseline = Some(ema(baseline, reading.power_kw));
            return None;
        }

        let change = (reading.power_kw - baseline) / baseline.max(0.1);

        if change > ANOMALY_SPIKE_THRESHOLD {
            let severity = if change > ANOMALY_SPIKE_HIGH {
                Severity::High
            } else {
                Severity::Medium
            };
            return Some(event(reading, AnomalyKind::Spike, severity, baseline, change));
        }

        // Outage outranks a generic drop: a dark meter with a real
        // baseline reads as change ≈ −1.0 and would otherwise always
        // classify as a drop.
        if reading.power_kw < ANOMALY_OUTAGE_POWER_KW && baseline > ANOMALY_OUTAGE_BASELINE_KW {
            return Some(event(reading, AnomalyKind::Outage, Severity::High, baseline, change));
        }

        if change < -ANOMALY_DROP_THRESHOLD {
            let severity = if change < -ANOMALY_DROP_MEDIUM {
                Severity::Medium
            } else {
                Severity::Low
            };
            return Some(event(reading, AnomalyKind::Drop, severity, baseline, change));
        }

        state.baseline = Some(ema(baseline, reading.power_kw));
        None
    }

    /// Meters currently tracked (observability).
    pub fn tracked_meters(&self) -> usize {
        self.meters.len()
    }
}

fn ema(baseline: f64, sample: f64) -> f64 {
    (1.0 - BASELINE_EMA_ALPHA) * baseline + BASELINE_EMA_ALPHA * sample
}

fn event(
    reading: &Reading,
    kind: AnomalyKind,
    severity: Severity,
    baseline: f64,
    change: f64,
) -> AnomalyEvent {
    AnomalyEvent {
        event_type: AnomalyEvent::EVENT_TYPE.to_string(),
        kind,
        severity,
        meter_id: reading.meter_id.clone(),
        region: reading.region.clone(),
        power_kw: reading.power_kw,
        baseline_kw: baseline,
        change,
        timestamp: reading.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(power: f64) -> Reading {
        Reading {
            reading_id: None,
            meter_id: "MTR-1".to_string(),
            region: "Pune-West".to_string(),
            timestamp: chrono::Utc::now(),
            power_kw: power,
            voltage: None,
            current: None,
            frequency: None,
            power_factor: None,
            energy_kwh: None,
            generation_kw: None,
            seq: None,
            status: None,
        }
    }

    fn warmed_detector(steady_kw: f64) -> AnomalyDetector {
        let mut detector = AnomalyDetector::new();
        for _ in 0..10 {
            assert!(detector.assess(&reading(steady_kw), || None).is_none());
        }
        detector
    }

    #[test]
    fn spike_after_warmup_is_medium() {
        // 10 steady readings at 2 kW converge the baseline to 2.0; an 11th
        // at 5 kW is change 1.5: anomalous, but below the high threshold.
        let mut detector = warmed_detector(2.0);
        let event = detector.assess(&reading(5.0), || None).unwrap();
        assert_eq!(event.kind, AnomalyKind::Spike);
        assert_eq!(event.severity, Severity::Medium);
        assert!((event.change - 1.5).abs() < 1e-9);
        assert_eq!(event.event_type, "ANOMALY");
    }

    #[test]
    fn extreme_spike_is_high() {
        let mut detector = warmed_detector(2.0);
        let event = detector.assess(&reading(8.5), || None).unwrap();
        assert_eq!(event.severity, Severity::High);
    }

    #[test]
    fn no_detection_during_warmup() {
        let mut detector = AnomalyDetector::new();
        for _ in 0..9 {
            assert!(detector.assess(&reading(2.0), || None).is_none());
        }
        // The 9 warmup samples include the jump. Still quiet.
        assert!(detector.assess(&reading(50.0), || None).is_none());
    }

    #[test]
    fn drop_severity_scales_with_depth() {
        let mut detector = warmed_detector(10.0);
        let event = detector.assess(&reading(4.0), || None).unwrap();
        assert_eq!(event.kind, AnomalyKind::Drop);
        assert_eq!(event.severity, Severity::Low);

        let mut detector = warmed_detector(10.0);
        let event = detector.assess(&reading(1.5), || None).unwrap();
        assert_eq!(event.kind, AnomalyKind::Drop);
        assert_eq!(event.severity, Severity::Medium);
    }

    #[test]
    fn dark_meter_with_live_baseline_is_an_outage() {
        let mut detector = warmed_detector(5.0);
        let event = detector.assess(&reading(0.05), || None).unwrap();
        assert_eq!(event.kind, AnomalyKind::Outage);
        assert_eq!(event.severity, Severity::High);
    }

    #[test]
    fn anomalies_do_not_move_the_baseline() {
        let mut detector = warmed_detector(2.0);
        detector.assess(&reading(5.0), || None).unwrap();
        // Back at 2 kW: no anomaly, baseline still ~2.0.
        assert!(detector.assess(&reading(2.0), || None).is_none());
    }

    #[test]
    fn stored_baseline_seeds_cold_start() {
        let mut detector = AnomalyDetector::new();
        // Baseline restored from the store; the sample count still warms
        // up from 1.
        assert!(detector.assess(&reading(2.0), || Some(2.0)).is_none());
        for _ in 0..9 {
            detector.assess(&reading(2.0), || None);
        }
        // Sample 11 with the restored, converged baseline detects.
        let event = detector.assess(&reading(9.0), || None).unwrap();
        assert_eq!(event.kind, AnomalyKind::Spike);
    }

    #[test]
    fn first_sighting_adopts_sample_as_baseline() {
        let mut detector = AnomalyDetector::new();
        assert!(detector.assess(&reading(42.0), || None).is_none());
        assert_eq!(detector.tracked_meters(), 1);
    }
}
