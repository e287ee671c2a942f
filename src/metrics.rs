//! Process-wide observability counters.
//!
//! Runtime counters in Prometheus text format (version 0.0.4). No external
//! metrics crate: gauges, counters, and fixed-bucket histograms are plain
//! atomics, hand-formatted by [`Metrics::render`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

// ============================================================================
// Primitives
// ============================================================================

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge that can go up and down (connection counts).
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter family keyed by a single label value.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    series: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    pub fn inc(&self, label: &str) {
        self.series
            .entry(label.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.series
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render_into(&self, out: &mut String, name: &str, label_name: &str) {
        let mut entries: Vec<(String, u64)> = self
            .series
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        entries.sort();
        for (label, value) in entries {
            let _ = writeln!(out, "{name}{{{label_name}=\"{label}\"}} {value}");
        }
    }
}

/// Latency buckets in seconds, chosen for sub-second I/O paths.
const HISTOGRAM_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Fixed-bucket latency histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: HISTOGRAM_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render_into(&self, out: &mut String, name: &str) {
        for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(
            out,
            "{name}_sum {}",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{name}_count {count}");
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All pipeline counters, shared as one `Arc<Metrics>` across components.
#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,

    // Gateway
    pub ingest_success: LabeledCounter,
    pub ingest_errors: LabeledCounter,
    pub validation_errors: LabeledCounter,
    pub duplicates: Counter,
    pub publish_latency: Histogram,
    pub dedup_latency: Histogram,

    // Bus
    pub bus_publish_failures: Counter,

    // Stream processor
    pub readings_consumed: Counter,
    pub readings_late_dropped: Counter,
    pub flushes_1m: Counter,
    pub flushes_15m: Counter,
    pub flush_failures: Counter,
    pub aggregates_written: Counter,
    pub anomalies_detected: Counter,

    // Tariff engine
    pub tariff_updates_published: Counter,
    pub tariff_hysteresis_suppressed: Counter,
    pub tariff_overrides: Counter,

    // Alert engine
    pub alerts_published: Counter,
    pub alerts_cooldown_suppressed: Counter,
    pub alerts_dedup_suppressed: Counter,
    pub rule_eval_errors: Counter,

    // Notifier
    pub ws_connections: Gauge,
    pub ws_messages_sent: Counter,
    pub ws_messages_dropped: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            ingest_success: LabeledCounter::default(),
            ingest_errors: LabeledCounter::default(),
            validation_errors: LabeledCounter::default(),
            duplicates: Counter::default(),
            publish_latency: Histogram::default(),
            dedup_latency: Histogram::default(),
            bus_publish_failures: Counter::default(),
            readings_consumed: Counter::default(),
            readings_late_dropped: Counter::default(),
            flushes_1m: Counter::default(),
            flushes_15m: Counter::default(),
            flush_failures: Counter::default(),
            aggregates_written: Counter::default(),
            anomalies_detected: Counter::default(),
            tariff_updates_published: Counter::default(),
            tariff_hysteresis_suppressed: Counter::default(),
            tariff_overrides: Counter::default(),
            alerts_published: Counter::default(),
            alerts_cooldown_suppressed: Counter::default(),
            alerts_dedup_suppressed: Counter::default(),
            rule_eval_errors: Counter::default(),
            ws_connections: Gauge::default(),
            ws_messages_sent: Counter::default(),
            ws_messages_dropped: Counter::default(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render all series in Prometheus text format.
    pub fn render(&self) -> String {
        let mut body = String::with_capacity(4096);

        body.push_str("# HELP gridpulse_ingest_success_total Readings accepted by the gateway\n");
        body.push_str("# TYPE gridpulse_ingest_success_total counter\n");
        self.ingest_success
            .render_into(&mut body, "gridpulse_ingest_success_total", "region");

        body.push_str("# HELP gridpulse_ingest_errors_total Gateway errors by type\n");
        body.push_str("# TYPE gridpulse_ingest_errors_total counter\n");
        self.ingest_errors
            .render_into(&mut body, "gridpulse_ingest_errors_total", "error_type");

        body.push_str("# HELP gridpulse_validation_errors_total Field validation failures\n");
        body.push_str("# TYPE gridpulse_validation_errors_total counter\n");
        self.validation_errors
            .render_into(&mut body, "gridpulse_validation_errors_total", "field");

        body.push_str("# HELP gridpulse_duplicates_total Duplicate readings short-circuited\n");
        body.push_str("# TYPE gridpulse_duplicates_total counter\n");
        let _ = writeln!(body, "gridpulse_duplicates_total {}", self.duplicates.get());

        body.push_str("# HELP gridpulse_publish_latency_seconds Bus publish latency\n");
        body.push_str("# TYPE gridpulse_publish_latency_seconds histogram\n");
        self.publish_latency
            .render_into(&mut body, "gridpulse_publish_latency_seconds");

        body.push_str("# HELP gridpulse_dedup_latency_seconds Dedup check latency\n");
        body.push_str("# TYPE gridpulse_dedup_latency_seconds histogram\n");
        self.dedup_latency
            .render_into(&mut body, "gridpulse_dedup_latency_seconds");

        body.push_str("# HELP gridpulse_bus_publish_failures_total Publishes dropped after retry budget\n");
        body.push_str("# TYPE gridpulse_bus_publish_failures_total counter\n");
        let _ = writeln!(
            body,
            "gridpulse_bus_publish_failures_total {}",
            self.bus_publish_failures.get()
        );

        for (name, help, counter) in [
            (
                "gridpulse_readings_consumed_total",
                "Readings consumed by the stream processor",
                &self.readings_consumed,
            ),
            (
                "gridpulse_readings_late_dropped_total",
                "Late readings dropped after their bucket flushed",
                &self.readings_late_dropped,
            ),
            (
                "gridpulse_flushes_1m_total",
                "Completed 1-minute flushes",
                &self.flushes_1m,
            ),
            (
                "gridpulse_flushes_15m_total",
                "Completed 15-minute flushes",
                &self.flushes_15m,
            ),
            (
                "gridpulse_flush_failures_total",
                "Flush attempts that failed and were retained",
                &self.flush_failures,
            ),
            (
                "gridpulse_aggregates_written_total",
                "Aggregate rows upserted to the store",
                &self.aggregates_written,
            ),
            (
                "gridpulse_anomalies_detected_total",
                "Anomaly events published",
                &self.anomalies_detected,
            ),
            (
                "gridpulse_tariff_updates_total",
                "Tariff updates published",
                &self.tariff_updates_published,
            ),
            (
                "gridpulse_tariff_hysteresis_suppressed_total",
                "Tariff changes suppressed by hysteresis",
                &self.tariff_hysteresis_suppressed,
            ),
            (
                "gridpulse_tariff_overrides_total",
                "Operator tariff overrides applied",
                &self.tariff_overrides,
            ),
            (
                "gridpulse_alerts_published_total",
                "Processed alerts published",
                &self.alerts_published,
            ),
            (
                "gridpulse_alerts_cooldown_suppressed_total",
                "Alerts suppressed by rule cooldown",
                &self.alerts_cooldown_suppressed,
            ),
            (
                "gridpulse_alerts_dedup_suppressed_total",
                "Alerts suppressed by the cross-engine dedup marker",
                &self.alerts_dedup_suppressed,
            ),
            (
                "gridpulse_rule_eval_errors_total",
                "Rule evaluations that errored and were skipped",
                &self.rule_eval_errors,
            ),
            (
                "gridpulse_ws_messages_sent_total",
                "Frames delivered to WebSocket subscribers",
                &self.ws_messages_sent,
            ),
            (
                "gridpulse_ws_messages_dropped_total",
                "Frames dropped for slow WebSocket subscribers",
                &self.ws_messages_dropped,
            ),
        ] {
            let _ = writeln!(body, "# HELP {name} {help}");
            let _ = writeln!(body, "# TYPE {name} counter");
            let _ = writeln!(body, "{name} {}", counter.get());
        }

        body.push_str("# HELP gridpulse_ws_connections Current WebSocket connections\n");
        body.push_str("# TYPE gridpulse_ws_connections gauge\n");
        let _ = writeln!(body, "gridpulse_ws_connections {}", self.ws_connections.get());

        body.push_str("# HELP gridpulse_uptime_seconds Process uptime in seconds\n");
        body.push_str("# TYPE gridpulse_uptime_seconds gauge\n");
        let _ = writeln!(
            body,
            "gridpulse_uptime_seconds {}",
            self.started_at.elapsed().as_secs()
        );

        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counter_tracks_per_label() {
        let c = LabeledCounter::default();
        c.inc("Pune-West");
        c.inc("Pune-West");
        c.inc("Mumbai-North");
        assert_eq!(c.get("Pune-West"), 2);
        assert_eq!(c.get("Mumbai-North"), 1);
        assert_eq!(c.get("missing"), 0);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::default();
        h.observe(Duration::from_millis(2));
        h.observe(Duration::from_millis(200));
        let mut out = String::new();
        h.render_into(&mut out, "t");
        assert!(out.contains("t_bucket{le=\"0.25\"} 2"));
        assert!(out.contains("t_bucket{le=\"0.0025\"} 1"));
        assert!(out.contains("t_count 2"));
    }

    #[test]
    fn render_includes_labels_and_gauges() {
        let m = Metrics::new();
        m.ingest_success.inc("Pune-West");
        m.duplicates.inc();
        m.ws_connections.inc();
        let body = m.render();
        assert!(body.contains("gridpulse_ingest_success_total{region=\"Pune-West\"} 1"));
        assert!(body.contains("gridpulse_duplicates_total 1"));
        assert!(body.contains("gridpulse_ws_connections 1"));
        assert!(body.contains("# TYPE gridpulse_publish_latency_seconds histogram"));
    }
}
