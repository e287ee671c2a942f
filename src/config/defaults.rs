//! System-wide default constants.
//!
//! Centralises magic numbers that would otherwise scatter across the
//! components. Grouped by subsystem for easy discovery.

// ============================================================================
// Message Bus
// ============================================================================

/// Partitions per topic. Key-hash partitioning preserves per-meter ordering.
pub const BUS_PARTITIONS: usize = 8;

/// Maximum records buffered per partition before publishes are rejected
/// with backpressure.
pub const BUS_PARTITION_HIGH_WATER: usize = 100_000;

/// Low-water mark at which backpressure clears (records per partition).
pub const BUS_PARTITION_LOW_WATER: usize = 80_000;

/// Retention window for bus records (seconds). 3 600 = 1 hour.
pub const BUS_RETENTION_SECS: i64 = 3_600;

/// How often the retention sweeper truncates old records (seconds).
pub const BUS_RETENTION_SWEEP_SECS: u64 = 60;

/// Initial publish retry delay (milliseconds).
pub const PUBLISH_RETRY_INITIAL_MS: u64 = 300;

/// Maximum publish retry delay (milliseconds). 30 000 = 30 s cap.
pub const PUBLISH_RETRY_CAP_MS: u64 = 30_000;

/// Maximum publish attempts before the record is dropped.
pub const PUBLISH_RETRY_MAX_ATTEMPTS: u32 = 8;

/// Consumer auto-commit interval (seconds).
pub const CONSUMER_AUTOCOMMIT_SECS: u64 = 5;

// ============================================================================
// Cache TTLs
// ============================================================================

/// Ingestion dedup marker TTL (seconds).
pub const DEDUP_TTL_SECS: u64 = 60;

/// Meter liveness (`last_seen`) TTL (seconds). 3 600 = 1 hour.
pub const LAST_SEEN_TTL_SECS: u64 = 3_600;

/// Regional load snapshot TTL (seconds). 300 = 5 minutes.
pub const REGION_LOAD_TTL_SECS: u64 = 300;

/// Overload window sorted-set TTL (seconds). 600 = 10 minutes.
pub const OVERLOAD_WINDOW_TTL_SECS: u64 = 600;

/// Cross-engine alert dedup marker TTL (seconds). 300 = 5 minutes.
pub const ACTIVE_ALERT_TTL_SECS: u64 = 300;

/// How often the cache sweeper evicts expired entries (seconds).
pub const CACHE_SWEEP_SECS: u64 = 30;

// ============================================================================
// Stream Processor
// ============================================================================

/// 1-minute window length (seconds).
pub const WINDOW_1M_SECS: i64 = 60;

/// 15-minute window length (seconds).
pub const WINDOW_15M_SECS: i64 = 900;

/// Minimum samples per meter before anomaly detection activates.
pub const ANOMALY_MIN_SAMPLES: u64 = 10;

/// Relative change above which a spike anomaly is raised.
pub const ANOMALY_SPIKE_THRESHOLD: f64 = 1.0;

/// Spike change above which severity escalates to high.
pub const ANOMALY_SPIKE_HIGH: f64 = 2.0;

/// Relative drop below which a drop anomaly is raised.
pub const ANOMALY_DROP_THRESHOLD: f64 = 0.5;

/// Drop change below which severity escalates to medium.
pub const ANOMALY_DROP_MEDIUM: f64 = 0.8;

/// Power floor under which a meter with an established baseline is
/// considered dark (kW).
pub const ANOMALY_OUTAGE_POWER_KW: f64 = 0.1;

/// Baseline above which a dark meter counts as an outage (kW).
pub const ANOMALY_OUTAGE_BASELINE_KW: f64 = 1.0;

/// Exponential moving average weight for new samples.
pub const BASELINE_EMA_ALPHA: f64 = 0.2;

/// Load percentage at or above which a region-minute lands in the
/// overload window set.
pub const OVERLOAD_LOAD_PERCENTAGE: f64 = 90.0;

// ============================================================================
// Tariff Engine
// ============================================================================

/// Default base price per kWh (₹).
pub const BASE_PRICE_PER_KWH: f64 = 5.0;

/// Minimum price change (₹) below which no tariff update is published.
pub const TARIFF_MIN_CHANGE: f64 = 0.10;

/// Operator override price floor (₹).
pub const OVERRIDE_MIN_PRICE: f64 = 0.50;

/// Operator override price ceiling (₹).
pub const OVERRIDE_MAX_PRICE: f64 = 20.00;

/// Minimum override reason length (characters).
pub const OVERRIDE_MIN_REASON_LEN: usize = 10;

// ============================================================================
// Alert Engine
// ============================================================================

/// Liveness sweep cadence for the meter-outage rule (seconds).
pub const LIVENESS_SWEEP_SECS: u64 = 15;

/// Silence threshold for the meter-outage rule (milliseconds).
pub const METER_OUTAGE_SILENCE_MS: i64 = 30_000;

// ============================================================================
// Notification Broadcaster
// ============================================================================

/// Maximum concurrent WebSocket connections.
pub const WS_MAX_CONNECTIONS: usize = 10_000;

/// Ping cadence (seconds). Connections missing a pong by the next tick
/// are terminated.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Per-connection outbound queue depth. Messages beyond this are dropped
/// for that connection.
pub const WS_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Close code for failed authentication.
pub const WS_CLOSE_UNAUTHORIZED: u16 = 4001;

/// Close code when the connection cap is reached (policy violation).
pub const WS_CLOSE_CAPACITY: u16 = 1008;

// ============================================================================
// Regional Capacity
// ============================================================================

/// Capacity assumed for regions missing from the capacity table (kW).
pub const DEFAULT_REGION_CAPACITY_KW: f64 = 1_000_000.0;

/// Seed capacity table. Overridable via a TOML file
/// (`GRIDPULSE_CAPACITY_TABLE`).
pub const SEED_REGION_CAPACITY_KW: &[(&str, f64)] = &[
    ("Pune-West", 50_000.0),
    ("Pune-East", 45_000.0),
    ("Mumbai-North", 120_000.0),
    ("Mumbai-South", 110_000.0),
    ("Nagpur-Central", 30_000.0),
];

// ============================================================================
// Shutdown
// ============================================================================

/// Hard deadline for graceful shutdown (seconds).
pub const SHUTDOWN_DEADLINE_SECS: u64 = 30;
