//! GRIDPULSE: Smart-Grid Telemetry Backbone
//!
//! Streaming pipeline for smart-meter telemetry:
//!
//! - **Gateway**: HTTP ingestion with validation, dedup, and backpressure
//! - **Stream processor**: windowed per-meter/per-region aggregation plus
//!   adaptive-baseline anomaly detection
//! - **Tariff engine**: load-tiered regional pricing with hysteresis and
//!   operator overrides
//! - **Alert engine**: conditional rules with cooldowns and dedup markers
//! - **Notifier**: authenticated, channel-subscribed WebSocket fan-out
//!
//! Components communicate only through the embedded partitioned message
//! bus, the TTL cache, and the sled store.

pub mod alert;
pub mod bus;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod notifier;
pub mod processor;
pub mod store;
pub mod tariff;
pub mod types;

// Re-export the configuration entry point
pub use config::AppConfig;

// Re-export commonly used types
pub use types::{
    Alert, AlertStatus, AlertStatusUpdate, AnomalyEvent, AnomalyKind, MeterAggregate, Reading,
    RegionalAggregate, Severity, Tariff, TariffUpdate, TriggeredBy,
};

// Re-export component handles
pub use alert::AlertEngine;
pub use gateway::GatewayState;
pub use processor::StreamProcessor;
pub use tariff::TariffEngine;
