//! Alert HTTP surface: queries and status transitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::types::AlertStatus;

use super::{AlertEngine, StatusError};

/// Build the alert router.
pub fn router(engine: AlertEngine) -> Router {
    Router::new()
        .route("/alerts/active", get(active_alerts))
        .route("/alerts/:id", get(get_alert))
        .route("/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/alerts/:id/resolve", post(resolve_alert))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct ActiveQuery {
    #[serde(default = "default_active_limit")]
    limit: usize,
}

fn default_active_limit() -> usize {
    50
}

/// GET /alerts/active
async fn active_alerts(
    State(engine): State<AlertEngine>,
    Query(query): Query<ActiveQuery>,
) -> Response {
    match engine.store().active_alerts(query.limit.min(500)) {
        Ok(alerts) => (StatusCode::OK, Json(alerts)).into_response(),
        Err(e) => internal(e.to_string()),
    }
}

/// GET /alerts/{id}
async fn get_alert(State(engine): State<AlertEngine>, Path(id): Path<Uuid>) -> Response {
    match engine.store().get_alert(id) {
        Ok(Some(alert)) => (StatusCode::OK, Json(alert)).into_response(),
        Ok(None) => not_found(),
        Err(e) => internal(e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeBody {
    acknowledged_by: String,
}

/// POST /alerts/{id}/acknowledge
async fn acknowledge_alert(
    State(engine): State<AlertEngine>,
    Path(id): Path<Uuid>,
    Json(body): Json<AcknowledgeBody>,
) -> Response {
    transition_response(
        engine
            .transition(id, AlertStatus::Acknowledged, Some(body.acknowledged_by))
            .await,
    )
}

/// POST /alerts/{id}/resolve
async fn resolve_alert(State(engine): State<AlertEngine>, Path(id): Path<Uuid>) -> Response {
    transition_response(engine.transition(id, AlertStatus::Resolved, None).await)
}

fn transition_response(result: Result<crate::types::Alert, StatusError>) -> Response {
    match result {
        Ok(alert) => (StatusCode::OK, Json(alert)).into_response(),
        Err(StatusError::NotFound) => not_found(),
        Err(e @ StatusError::Illegal { .. }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(StatusError::Store(e)) => internal(e.to_string()),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "alert not found" })),
    )
        .into_response()
}

fn internal(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
