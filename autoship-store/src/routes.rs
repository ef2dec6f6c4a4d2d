//! HTTP route handlers for the task state store.
//!
//! Every route is addressed by project; each project is served by its own
//! ledger actor.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use autoship::core::ledger::{Ledger, LedgerEntry, ProgressEntry};
use autoship::core::types::{ExecutionResult, TaskRecordBody};
use autoship::error::StoreError;
use autoship::store::StoreHandle;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects/{project}/enqueue", post(enqueue))
        .route("/projects/{project}/complete", post(complete))
        .route("/projects/{project}/fail", post(fail))
        .route("/projects/{project}/get-next-task", get(next_task))
        .route("/projects/{project}/get-prd", get(get_prd))
        .route("/projects/{project}/get-progress", get(get_progress))
        .route("/projects/{project}/update-progress", post(update_progress))
        .route("/projects/{project}/dispatch", post(dispatch))
}

/// [`StoreError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &StoreError) -> StatusCode {
    match err {
        StoreError::TaskNotFound(_) | StoreError::UnknownProject(_) => StatusCode::NOT_FOUND,
        StoreError::Validation(_) => StatusCode::BAD_REQUEST,
        StoreError::ActorClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(err = %format!("{:#}", self.0), "store request failed");
        }
        let mut body = json!({ "error": self.0.to_string() });
        if let StoreError::Validation(fields) = &self.0 {
            body["fields"] = json!(fields);
        }
        (status, Json(body)).into_response()
    }
}

fn project<'a>(state: &'a AppState, name: &str) -> Result<&'a StoreHandle, ApiError> {
    Ok(state.projects.get(name)?)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "projects": state.projects.names().collect::<Vec<_>>(),
    }))
}

/// POST /projects/{project}/enqueue - insert or reset a task.
async fn enqueue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<TaskRecordBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = project(&state, &name)?;
    let task = body.normalize().map_err(StoreError::Validation)?;
    let task_id = task.id.clone();
    let entry = store.enqueue(task).await?;
    Ok(Json(json!({ "taskId": task_id, "entry": entry })))
}

/// POST /projects/{project}/complete - execution callback.
async fn complete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(result): Json<ExecutionResult>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let store = project(&state, &name)?;
    Ok(Json(store.complete(result).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailBody {
    task_id: Option<String>,
    error: Option<String>,
    dispatch_id: Option<String>,
}

/// POST /projects/{project}/fail - record a failed attempt.
async fn fail(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<FailBody>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let store = project(&state, &name)?;
    let Some(task_id) = body.task_id.filter(|t| !t.trim().is_empty()) else {
        return Err(StoreError::Validation(vec!["taskId".to_string()]).into());
    };
    let error = body
        .error
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "unknown error".to_string());
    let dispatch_id = body.dispatch_id.filter(|d| !d.trim().is_empty());
    Ok(Json(store.fail(&task_id, dispatch_id.as_deref(), &error).await?))
}

/// GET /projects/{project}/get-next-task - peek at the next eligible task.
async fn next_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = project(&state, &name)?;
    let next = store.next_task().await?;
    let task = next.map(|(task_id, entry)| json!({ "taskId": task_id, "entry": entry }));
    Ok(Json(json!({ "task": task })))
}

/// GET /projects/{project}/get-prd - full ledger snapshot.
async fn get_prd(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Ledger>, ApiError> {
    let store = project(&state, &name)?;
    Ok(Json(store.ledger().await?))
}

/// GET /projects/{project}/get-progress - flat progress log.
async fn get_progress(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<String, ApiError> {
    let store = project(&state, &name)?;
    Ok(store.progress().await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBody {
    task_id: Option<String>,
    description: Option<String>,
    #[serde(default)]
    learnings: Vec<String>,
    #[serde(default)]
    files_changed: Vec<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl ProgressBody {
    fn into_entry(self) -> Result<ProgressEntry, StoreError> {
        let Some(task_id) = self.task_id.filter(|t| !t.trim().is_empty()) else {
            return Err(StoreError::Validation(vec!["taskId".to_string()]));
        };
        Ok(ProgressEntry {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            task_id,
            description: self.description.unwrap_or_default(),
            learnings: self.learnings,
            files_changed: self.files_changed,
        })
    }
}

/// POST /projects/{project}/update-progress - append an external entry.
async fn update_progress(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ProgressBody>,
) -> Result<StatusCode, ApiError> {
    let store = project(&state, &name)?;
    store.append_progress(body.into_entry()?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /projects/{project}/dispatch - run one dispatch cycle now.
async fn dispatch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = project(&state, &name)?;
    let dispatched = store.dispatch().await?;
    Ok(Json(json!({ "dispatched": dispatched })))
}
