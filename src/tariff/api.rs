//! Operator HTTP surface for the tariff engine.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{OverrideRequest, TariffEngine, TariffError};

/// Bearer guard for mutating operator endpoints. When no operator key is
/// configured the deployment is trusted and requests pass through.
pub struct OperatorAuth;

#[async_trait]
impl FromRequestParts<TariffEngine> for OperatorAuth {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        engine: &TariffEngine,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = engine.operator_key() else {
            return Ok(OperatorAuth);
        };
        let presented = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) if token == expected => Ok(OperatorAuth),
            Some(_) => Err((
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": "invalid operator key" })),
            )),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "missing bearer token" })),
            )),
        }
    }
}

/// Build the operator router.
pub fn router(engine: TariffEngine) -> Router {
    Router::new()
        .route("/operator/tariff/override", post(override_tariff))
        .route("/operator/tariff/:region", get(current_tariff))
        .route("/operator/tariff/:region/history", get(tariff_history))
        .route("/operator/tariffs/all", get(all_tariffs))
        .with_state(engine)
}

/// POST /operator/tariff/override
async fn override_tariff(
    State(engine): State<TariffEngine>,
    _auth: OperatorAuth,
    Json(request): Json<OverrideRequest>,
) -> Response {
    match engine.apply_override(&request).await {
        Ok(update) => (StatusCode::OK, Json(update)).into_response(),
        Err(TariffError::Invalid(message)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        Err(TariffError::Store(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /operator/tariff/{region}
async fn current_tariff(
    State(engine): State<TariffEngine>,
    Path(region): Path<String>,
) -> Response {
    match engine.store().current_tariff(&region) {
        Ok(Some(tariff)) => (StatusCode::OK, Json(tariff)).into_response(),
        Ok(None) => {
            // The cache may hold a price the store has not seen (warm
            // standby); surface it rather than 404.
            match engine.cache().tariff(&region) {
                Ok(Some(price)) => (
                    StatusCode::OK,
                    Json(serde_json::json!({ "region": region, "pricePerKwh": price })),
                )
                    .into_response(),
                _ => (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({ "error": format!("no tariff for region {region}") })),
                )
                    .into_response(),
            }
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

/// GET /operator/tariff/{region}/history?limit=..
async fn tariff_history(
    State(engine): State<TariffEngine>,
    Path(region): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match engine.store().tariff_history(&region, query.limit.min(500)) {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /operator/tariffs/all
async fn all_tariffs(State(engine): State<TariffEngine>) -> Response {
    match engine.store().all_current_tariffs() {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
