//! Gateway request handlers.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{topics, BusError};
use crate::types::Reading;

use super::validation::{validate_reading, FieldError};
use super::GatewayState;

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestAccepted {
    status: &'static str,
    topic: String,
    partition: usize,
    offset: u64,
}

#[derive(Debug, Serialize)]
struct IngestDuplicate {
    status: &'static str,
    duplicate: bool,
}

#[derive(Debug, Serialize)]
struct ValidationFailed {
    status: &'static str,
    errors: Vec<FieldError>,
}

#[derive(Debug, Serialize)]
struct BatchOutcome {
    status: &'static str,
    accepted: usize,
    duplicates: usize,
    failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<BatchItemError>,
}

#[derive(Debug, Serialize)]
struct BatchItemError {
    index: usize,
    errors: Vec<FieldError>,
}

fn error_body(message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "error", "error": message }))
}

// ============================================================================
// Single reading
// ============================================================================

/// POST /telemetry
pub async fn ingest_reading(
    State(state): State<GatewayState>,
    Json(body): Json<Value>,
) -> Response {
    let inner = state.inner();

    if state.is_saturated() {
        inner.metrics.ingest_errors.inc("backpressure");
        return (StatusCode::SERVICE_UNAVAILABLE, error_body("ingestion saturated")).into_response();
    }

    let reading = match validate_reading(&body) {
        Ok(reading) => reading,
        Err(errors) => {
            for e in &errors {
                inner.metrics.validation_errors.inc(&e.field);
            }
            return (
                StatusCode::BAD_REQUEST,
                Json(ValidationFailed {
                    status: "error",
                    errors,
                }),
            )
                .into_response();
        }
    };

    // Dedup on (meterId, timestamp). A cache failure fails open: an
    // occasional duplicate downstream beats losing the reading.
    let dedup_started = Instant::now();
    let first_sighting = match inner.cache.claim_reading(&reading.meter_id, reading.timestamp) {
        Ok(first) => first,
        Err(e) => {
            debug!("Dedup check unavailable, admitting reading: {e}");
            true
        }
    };
    inner.metrics.dedup_latency.observe(dedup_started.elapsed());

    if !first_sighting {
        inner.metrics.duplicates.inc();
        return (
            StatusCode::OK,
            Json(IngestDuplicate {
                status: "success",
                duplicate: true,
            }),
        )
            .into_response();
    }

    let publish_started = Instant::now();
    let published = inner
        .publisher
        .publish_json(topics::RAW_READINGS, &reading.meter_id, &reading)
        .await;
    inner.metrics.publish_latency.observe(publish_started.elapsed());

    match published {
        Ok(ack) => {
            inner.metrics.ingest_success.inc(&reading.region);
            touch_liveness(&state, &reading);
            (
                StatusCode::OK,
                Json(IngestAccepted {
                    status: "success",
                    topic: ack.topic,
                    partition: ack.partition,
                    offset: ack.offset,
                }),
            )
                .into_response()
        }
        Err(e @ (BusError::Backpressure { .. } | BusError::RetryExhausted { .. })) => {
            inner.metrics.ingest_errors.inc(e.label());
            (StatusCode::SERVICE_UNAVAILABLE, error_body("ingestion saturated")).into_response()
        }
        Err(e) => {
            inner.metrics.ingest_errors.inc(e.label());
            warn!("Publish failed permanently: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("publish failed")).into_response()
        }
    }
}

/// Refresh `last_seen:{meter}` off the request path.
fn touch_liveness(state: &GatewayState, reading: &Reading) {
    let state = state.clone();
    let meter_id = reading.meter_id.clone();
    let region = reading.region.clone();
    let seen_at = reading.timestamp;
    tokio::spawn(async move {
        if let Err(e) = state
            .inner()
            .cache
            .update_meter_last_seen(&meter_id, &region, seen_at)
        {
            debug!("Liveness refresh failed for {meter_id}: {e}");
        }
    });
}

// ============================================================================
// Batch
// ============================================================================

/// POST /telemetry/batch
pub async fn ingest_batch(
    State(state): State<GatewayState>,
    Json(body): Json<Value>,
) -> Response {
    let inner = state.inner();

    if state.is_saturated() {
        inner.metrics.ingest_errors.inc("backpressure");
        return (StatusCode::SERVICE_UNAVAILABLE, error_body("ingestion saturated")).into_response();
    }

    let Some(items) = body.as_array() else {
        return (StatusCode::BAD_REQUEST, error_body("expected a JSON array")).into_response();
    };
    if items.is_empty() || items.len() > 1000 {
        return (
            StatusCode::BAD_REQUEST,
            error_body("batch size must be between 1 and 1000"),
        )
            .into_response();
    }

    let mut item_errors = Vec::new();
    let mut candidates: Vec<(usize, Reading)> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match validate_reading(item) {
            Ok(reading) => candidates.push((index, reading)),
            Err(errors) => {
                for e in &errors {
                    inner.metrics.validation_errors.inc(&e.field);
                }
                item_errors.push(BatchItemError { index, errors });
            }
        }
    }

    // Dedup the valid subset concurrently, preserving order.
    let dedup_started = Instant::now();
    let checks = futures::future::join_all(candidates.iter().map(|(_, reading)| {
        let state = state.clone();
        let meter_id = reading.meter_id.clone();
        let timestamp = reading.timestamp;
        async move {
            state
                .inner()
                .cache
                .claim_reading(&meter_id, timestamp)
                .unwrap_or(true)
        }
    }))
    .await;
    inner.metrics.dedup_latency.observe(dedup_started.elapsed());

    let mut duplicates = 0usize;
    let mut unique: Vec<(usize, Reading)> = Vec::with_capacity(candidates.len());
    for ((index, reading), first_sighting) in candidates.into_iter().zip(checks) {
        if first_sighting {
            unique.push((index, reading));
        } else {
            duplicates += 1;
            inner.metrics.duplicates.inc();
        }
    }

    // Single produce call for the unique subset. Keep the serialized
    // records aligned with their readings so results map back correctly.
    let mut accepted = 0usize;
    let mut publish_failed = 0usize;
    if !unique.is_empty() {
        let mut records = Vec::with_capacity(unique.len());
        let mut sendable: Vec<&Reading> = Vec::with_capacity(unique.len());
        for (index, reading) in &unique {
            match serde_json::to_vec(reading) {
                Ok(payload) => {
                    records.push((reading.meter_id.clone(), payload));
                    sendable.push(reading);
                }
                Err(e) => {
                    warn!("Dropping unserializable batch item {index}: {e}");
                    publish_failed += 1;
                }
            }
        }
        let publish_started = Instant::now();
        let results = inner.bus.publish_batch(topics::RAW_READINGS, records);
        inner.metrics.publish_latency.observe(publish_started.elapsed());

        for (result, reading) in results.iter().zip(sendable) {
            match result {
                Ok(_) => {
                    accepted += 1;
                    inner.metrics.ingest_success.inc(&reading.region);
                    touch_liveness(&state, reading);
                }
                Err(e) => {
                    publish_failed += 1;
                    inner.metrics.ingest_errors.inc(e.label());
                }
            }
        }
    }

    let failed = item_errors.len() + publish_failed;
    let status = if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (
        status,
        Json(BatchOutcome {
            status: if failed == 0 { "success" } else { "partial" },
            accepted,
            duplicates,
            failed,
            errors: item_errors,
        }),
    )
        .into_response()
}

// ============================================================================
// Health & metrics
// ============================================================================

/// GET /health
pub async fn health(State(state): State<GatewayState>) -> Response {
    let depth = state
        .inner()
        .bus
        .depth(topics::RAW_READINGS);
    if state.is_saturated() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "rawReadingsDepth": depth })),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "rawReadingsDepth": depth })),
    )
        .into_response()
}

/// GET /metrics, Prometheus text format (version 0.0.4).
pub async fn metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.inner().metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::super::{router, GatewayState};
    use crate::bus::{topics, Bus};
    use crate::cache::Cache;
    use crate::metrics::Metrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> (GatewayState, Arc<Bus>, Arc<Cache>) {
        let bus = Arc::new(Bus::new(4, 1000));
        let cache = Arc::new(Cache::new());
        let metrics = Arc::new(Metrics::new());
        (
            GatewayState::new(Arc::clone(&bus), Arc::clone(&cache), metrics),
            bus,
            cache,
        )
    }

    fn telemetry_request(body: serde_json::Value) -> Request<Body> {
        Request::post("/telemetry")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn valid_reading() -> serde_json::Value {
        serde_json::json!({
            "meterId": "MTR-1",
            "region": "Pune-West",
            "timestamp": "2025-11-07T10:00:00Z",
            "powerKw": 2.5
        })
    }

    #[tokio::test]
    async fn valid_reading_is_accepted_and_published() {
        let (state, bus, _cache) = test_state();
        let app = router(state);

        let resp = app.oneshot(telemetry_request(valid_reading())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "success");
        assert_eq!(v["topic"], topics::RAW_READINGS);
        assert!(v.get("duplicate").is_none());
        assert_eq!(bus.depth(topics::RAW_READINGS), 1);
    }

    #[tokio::test]
    async fn second_identical_reading_reports_duplicate() {
        let (state, bus, _cache) = test_state();
        let app = router(state);

        let first = app
            .clone()
            .oneshot(telemetry_request(valid_reading()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(telemetry_request(valid_reading())).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let v = body_json(second).await;
        assert_eq!(v["duplicate"], true);
        // Exactly one record made it to the bus.
        assert_eq!(bus.depth(topics::RAW_READINGS), 1);
    }

    #[tokio::test]
    async fn invalid_reading_names_the_field() {
        let (state, _bus, _cache) = test_state();
        let app = router(state);

        let mut body = valid_reading();
        body["powerKw"] = serde_json::json!(-3.0);
        let resp = app.oneshot(telemetry_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let v = body_json(resp).await;
        assert!(v["errors"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["field"] == "powerKw"));
    }

    #[tokio::test]
    async fn unavailable_dedup_fails_open() {
        let (state, bus, cache) = test_state();
        cache.poison();
        let app = router(state);

        let resp = app.oneshot(telemetry_request(valid_reading())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "success");
        assert!(v.get("duplicate").is_none());
        assert_eq!(bus.depth(topics::RAW_READINGS), 1);
    }

    #[tokio::test]
    async fn batch_mixes_accepts_duplicates_and_failures() {
        let (state, _bus, _cache) = test_state();
        let app = router(state);

        let batch = serde_json::json!([
            valid_reading(),
            valid_reading(), // duplicate of the first
            { "meterId": "", "region": "Pune-West", "timestamp": "2025-11-07T10:00:00Z", "powerKw": 1.0 },
            { "meterId": "MTR-2", "region": "Pune-West", "timestamp": "2025-11-07T10:00:05Z", "powerKw": 4.0 }
        ]);
        let resp = app
            .oneshot(
                Request::post("/telemetry/batch")
                    .header("content-type", "application/json")
                    .body(Body::from(batch.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
        let v = body_json(resp).await;
        assert_eq!(v["accepted"], 2);
        assert_eq!(v["duplicates"], 1);
        assert_eq!(v["failed"], 1);
        assert_eq!(v["errors"][0]["index"], 2);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let (state, _bus, _cache) = test_state();
        let app = router(state);
        let batch: Vec<serde_json::Value> = (0..1001).map(|_| valid_reading()).collect();
        let resp = app
            .oneshot(
                Request::post("/telemetry/batch")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!(batch).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn saturation_returns_503_until_drained() {
        let bus = Arc::new(Bus::new(1, 1000));
        let cache = Arc::new(Cache::new());
        let metrics = Arc::new(Metrics::new());
        let state = GatewayState::with_watermarks(
            Arc::clone(&bus),
            cache,
            metrics,
            2, // high water
            1, // low water
        );
        let app = router(state);

        // Fill the backlog past the high-water mark.
        bus.publish(topics::RAW_READINGS, "a", b"1".to_vec()).unwrap();
        bus.publish(topics::RAW_READINGS, "b", b"2".to_vec()).unwrap();

        let resp = app
            .clone()
            .oneshot(telemetry_request(valid_reading()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Drain below the low-water mark; the gate reopens.
        bus.sweep_retention(chrono::Utc::now() + chrono::Duration::seconds(1));
        let resp = app.oneshot(telemetry_request(valid_reading())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let (state, _bus, _cache) = test_state();
        let app = router(state);
        app.clone()
            .oneshot(telemetry_request(valid_reading()))
            .await
            .unwrap();
        let resp = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("gridpulse_ingest_success_total{region=\"Pune-West\"} 1"));
    }
}
