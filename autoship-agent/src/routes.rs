//! HTTP route handlers for the execution agent.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::json;
use tracing::{info, warn};

use autoship::core::types::ExecutionRequestBody;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .route("/status/{id}", get(status))
        .route("/cancel/{id}", post(cancel))
}

/// Errors surfaced to HTTP callers.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Invalid(Vec<String>),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing or invalid bearer token" })),
            )
                .into_response(),
            Self::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("execution not found: {id}") })),
            )
                .into_response(),
            Self::Invalid(fields) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("missing or invalid fields: {}", fields.join(", ")),
                    "fields": fields,
                })),
            )
                .into_response(),
        }
    }
}

/// Check `Authorization: Bearer <token>` when a token is configured.
pub fn authorize(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "executions": state.agent.registry().active_count(),
    }))
}

/// POST /execute - accept a request and run it in the background.
async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecutionRequestBody>,
) -> Result<Response, ApiError> {
    authorize(&headers, state.auth_token.as_deref())?;
    let request = body
        .validate(state.agent.config().default_max_iterations)
        .map_err(|fields| {
            warn!(fields = ?fields, "rejected execution request");
            ApiError::Invalid(fields)
        })?;
    let accepted = state.agent.submit(request);
    info!(
        execution_id = %accepted.execution_id,
        task_id = %accepted.task_id,
        "execution accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// GET /status/{id} - in-memory execution state.
async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authorize(&headers, state.auth_token.as_deref())?;
    let snapshot = state.agent.status(&id).ok_or(ApiError::NotFound(id))?;
    Ok(Json(snapshot).into_response())
}

/// POST /cancel/{id} - best-effort cancellation.
async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authorize(&headers, state.auth_token.as_deref())?;
    match state.agent.cancel(&id).await {
        Some(snapshot) => Ok(Json(snapshot).into_response()),
        None => Err(ApiError::NotFound(id)),
    }
}
