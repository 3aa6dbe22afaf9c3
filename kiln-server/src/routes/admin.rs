//! Reaper admin endpoints: inspect and trigger zombie-task sweeps.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::task::{ReapReportResponse, TaskResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(preview_reap, run_sweep),
    components(schemas(ReapReportResponse))
)]
pub struct AdminApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reaper/preview", get(preview_reap))
        .route("/reaper/sweep", post(run_sweep))
}

/// The stale tasks the next sweep would reap, without acting on them.
#[utoipa::path(
    get,
    path = "/admin/reaper/preview",
    tag = "admin",
    responses(
        (status = 200, description = "Stale task candidates", body = [TaskResponse]),
    )
)]
pub async fn preview_reap(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let tasks = state.reaper.preview().await?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from_task).collect()))
}

/// Trigger a sweep immediately instead of waiting for the next interval.
#[utoipa::path(
    post,
    path = "/admin/reaper/sweep",
    tag = "admin",
    responses(
        (status = 200, description = "Sweep summary", body = ReapReportResponse),
    )
)]
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReapReportResponse>, ServerError> {
    let report = state.reaper.sweep().await?;
    Ok(Json(ReapReportResponse {
        examined: report.examined,
        reaped: report.reaped,
        refunded: report.refunded,
    }))
}
