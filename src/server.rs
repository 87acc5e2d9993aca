//! Read-only HTTP query surface over the candle store.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::StoreError;
use crate::model::candle::Candle;
use crate::model::duration::{CandleDuration, DurationSet};
use crate::store::{series_name, CandleStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn CandleStore>,
    pub durations: DurationSet,
    pub default_duration: CandleDuration,
    pub max_limit: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/candle/", get(candles))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonError {
    pub error: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Store(StoreError::InvalidSeriesName(name)) => (
                StatusCode::BAD_REQUEST,
                format!("unknown series '{}'", name),
            ),
            Self::Store(e) => {
                tracing::error!(error = %e, "Candle query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        let body = JsonError {
            error,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CandleQuery {
    pub product_code: Option<String>,
    pub duration: Option<String>,
    /// Kept as text so malformed values fall back instead of rejecting.
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CandleFrame {
    pub product_code: String,
    pub duration: CandleDuration,
    pub candles: Vec<Candle>,
}

/// Missing, unparsable, negative or oversized limits all become `max_limit`.
pub fn resolve_limit(raw: Option<&str>, max_limit: usize) -> usize {
    match raw.map(str::trim).and_then(|s| s.parse::<i64>().ok()) {
        Some(n) if n >= 0 && (n as u64) <= max_limit as u64 => n as usize,
        _ => max_limit,
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn candles(
    State(state): State<ApiState>,
    Query(q): Query<CandleQuery>,
) -> Result<Json<CandleFrame>, ApiError> {
    let product_code = q
        .product_code
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("no product_code".to_string()))?
        .to_string();

    let requested = q.duration.as_deref().map(str::trim).filter(|d| !d.is_empty());
    let duration = match requested {
        None => state.default_duration.clone(),
        Some(label) => state
            .durations
            .find(label)
            .cloned()
            .ok_or_else(|| ApiError::BadRequest(format!("unsupported duration '{}'", label)))?,
    };
    series_name(&product_code, &duration)?;
    let limit = resolve_limit(q.limit.as_deref(), state.max_limit);

    let candles = state.store.get_range(&product_code, &duration, limit)?;
    Ok(Json(CandleFrame {
        product_code,
        duration,
        candles,
    }))
}
