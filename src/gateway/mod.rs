//! HTTP ingestion gateway.
//!
//! Endpoints:
//! - `POST /telemetry`: validate, dedup, publish to `raw_readings`
//! - `POST /telemetry/batch`: up to 1 000 readings per call
//! - `GET /health`: 503 while the producer path is saturated
//! - `GET /metrics`: Prometheus text
//!
//! Dedup fails open: a cache error admits the reading rather than losing
//! it. Backpressure is hysteretic: once the `raw_readings` backlog
//! crosses the high-water mark the gateway answers 503 until the backlog
//! drains below the low-water mark.

mod handlers;
mod validation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::{Bus, Publisher};
use crate::cache::Cache;
use crate::config::defaults::{BUS_PARTITION_HIGH_WATER, BUS_PARTITION_LOW_WATER};
use crate::metrics::Metrics;

pub use validation::{validate_reading, FieldError};

struct GatewayInner {
    bus: Arc<Bus>,
    publisher: Publisher,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
    high_water: usize,
    low_water: usize,
    saturated: AtomicBool,
}

/// Shared gateway state behind the axum router.
#[derive(Clone)]
pub struct GatewayState(Arc<GatewayInner>);

impl GatewayState {
    pub fn new(bus: Arc<Bus>, cache: Arc<Cache>, metrics: Arc<Metrics>) -> Self {
        Self::with_watermarks(
            bus,
            cache,
            metrics,
            BUS_PARTITION_HIGH_WATER,
            BUS_PARTITION_LOW_WATER,
        )
    }

    pub fn with_watermarks(
        bus: Arc<Bus>,
        cache: Arc<Cache>,
        metrics: Arc<Metrics>,
        high_water: usize,
        low_water: usize,
    ) -> Self {
        let publisher = Publisher::new(Arc::clone(&bus), Arc::clone(&metrics));
        Self(Arc::new(GatewayInner {
            bus,
            publisher,
            cache,
            metrics,
            high_water,
            low_water,
            saturated: AtomicBool::new(false),
        }))
    }

    fn inner(&self) -> &GatewayInner {
        &self.0
    }

    /// Hysteretic saturation check against the `raw_readings` backlog.
    fn is_saturated(&self) -> bool {
        let inner = self.inner();
        let depth = inner.bus.depth(crate::bus::topics::RAW_READINGS);
        if inner.saturated.load(Ordering::Relaxed) {
            if depth < inner.low_water {
                inner.saturated.store(false, Ordering::Relaxed);
                return false;
            }
            return true;
        }
        if depth >= inner.high_water {
            inner.saturated.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/telemetry", post(handlers::ingest_reading))
        .route("/telemetry/batch", post(handlers::ingest_batch))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
