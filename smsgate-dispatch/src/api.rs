use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use smsgate_core::EventKind;

use crate::history::{HistoryStats, Notification, NotificationHistory};
use crate::state::{DeviceRegistry, DeviceSnapshot};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub registry: DeviceRegistry,
    pub history: Option<NotificationHistory>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = ErrorResponse {
            success: false,
            message,
            error: status.canonical_reason().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub devices: Vec<DeviceSnapshot>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationQuery {
    pub limit: Option<u32>,
    pub kind: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/notifications", get(notifications))
        .route("/api/stats", get(stats))
        .with_state(state)
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_secs: state.registry.uptime_secs().await,
        devices: state.registry.snapshot().await,
    })
}

pub async fn notifications(
    State(state): State<ApiState>,
    Query(params): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let history = history(&state)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<EventKind>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    history
        .recent(limit, kind)
        .await
        .map(Json)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))
}

pub async fn stats(State(state): State<ApiState>) -> Result<Json<HistoryStats>, ApiError> {
    history(&state)?
        .stats()
        .await
        .map(Json)
        .map_err(|e| ApiError::InternalServerError(e.to_string()))
}

fn history(state: &ApiState) -> Result<&NotificationHistory, ApiError> {
    state
        .history
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("notification history is not enabled".to_string()))
}
