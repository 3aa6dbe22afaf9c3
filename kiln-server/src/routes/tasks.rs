//! Task API endpoints.
//!
//! The caller's identity arrives in the `x-user-id` header (this service
//! sits behind the platform gateway, which authenticates and injects it).
//! Retried creations may carry an `x-idempotency-key` header; a repeated
//! key returns the originally created task and is never double-charged.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::task::{CreateTaskRequest, ListTasksQuery, TaskResponse};
use crate::state::AppState;

pub static X_USER_ID: &str = "x-user-id";
pub static X_IDEMPOTENCY_KEY: &str = "x-idempotency-key";

#[derive(OpenApi)]
#[openapi(
    paths(create_task, list_tasks, get_task, cancel_task),
    components(schemas(CreateTaskRequest, TaskResponse, ListTasksQuery))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
}

fn user_id(headers: &HeaderMap) -> Result<String, ServerError> {
    headers
        .get(X_USER_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ServerError::BadRequest(format!("missing {X_USER_ID} header")))
}

/// Create a generation task.
///
/// Runs the admission checks synchronously and returns the row already in
/// `PROCESSING`; all further progress is observable through
/// `GET /v1/tasks/{id}`.
#[utoipa::path(
    post,
    path = "/v1/tasks",
    tag = "tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 200, description = "Task created", body = TaskResponse),
        (status = 400, description = "Bad request"),
        (status = 402, description = "Insufficient credits"),
        (status = 403, description = "Capability not permitted"),
        (status = 429, description = "Concurrency limit reached"),
        (status = 503, description = "Orchestrator queue full"),
    )
)]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Json<TaskResponse>, ServerError> {
    let user = user_id(&headers)?;
    if body.prompt.trim().is_empty() {
        return Err(ServerError::BadRequest("prompt must not be empty".to_owned()));
    }
    let idempotency_key = headers
        .get(X_IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let task = state
        .orchestrator
        .create(&user, body.into_new_task(), idempotency_key)
        .await?;
    Ok(Json(TaskResponse::from_task(task)))
}

/// List the caller's most recent tasks, newest first.
#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    params(ListTasksQuery),
    responses(
        (status = 200, description = "Tasks listed", body = [TaskResponse]),
        (status = 400, description = "Bad request"),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let user = user_id(&headers)?;
    let tasks = state
        .orchestrator
        .list_recent(&user, q.limit.unwrap_or(50).min(200))
        .await?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from_task).collect()))
}

/// Fetch one task by ID.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task retrieved", body = TaskResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let user = user_id(&headers)?;
    let task = state.orchestrator.get(&id).await?;
    // Tasks are private to their owner.
    if task.user_id != user {
        return Err(ServerError::NotFound(format!("task {id} not found")));
    }
    Ok(Json(TaskResponse::from_task(task)))
}

/// Cancel a non-terminal task.
///
/// The charge is refunded; any in-flight vendor poll stops on its next
/// iteration. Cancelling an already-terminal task is a no-op.
#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/cancel",
    tag = "tasks",
    params(("id" = String, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Cancellation outcome", body = serde_json::Value),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = user_id(&headers)?;
    let task = state.orchestrator.get(&id).await?;
    if task.user_id != user {
        return Err(ServerError::NotFound(format!("task {id} not found")));
    }

    let cancelled = state.orchestrator.cancel(&id).await?;
    Ok(Json(serde_json::json!({
        "task_id": id,
        "cancelled": cancelled,
    })))
}
