//! Execution endpoints
//!
//! Start returns 202 immediately; the background task does the work and the
//! client polls `GET /executions/{id}` (or listens on `/events`).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::{Execution, ExecutionRequest, ExecutionStatusReport};
use crate::AppState;

/// POST /executions
pub async fn start_execution(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> ApiResult<(StatusCode, Json<Execution>)> {
    tracing::debug!(
        user_id = %request.user_id,
        tier = %request.tier,
        poses = request.poses.len(),
        "Start execution request"
    );

    let execution = state
        .orchestrator
        .start_execution(request)
        .await
        .map_err(|e| state.observe(e))?;

    Ok((StatusCode::ACCEPTED, Json(execution)))
}

/// GET /executions/{id}
pub async fn get_execution_status(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<ExecutionStatusReport>> {
    let report = state
        .orchestrator
        .get_execution_status(execution_id)
        .await
        .map_err(|e| state.observe(e))?;
    Ok(Json(report))
}

/// POST /executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<Execution>> {
    let execution = state
        .orchestrator
        .cancel_execution(execution_id)
        .await
        .map_err(|e| state.observe(e))?;
    Ok(Json(execution))
}

pub fn execution_routes() -> Router<AppState> {
    Router::new()
        .route("/executions", post(start_execution))
        .route("/executions/:id", get(get_execution_status))
        .route("/executions/:id/cancel", post(cancel_execution))
}
