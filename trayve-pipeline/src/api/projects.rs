//! Project results gallery

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::GenerationResult;
use crate::AppState;

/// GET /projects/{id}/results
pub async fn project_results(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<GenerationResult>>> {
    let results = state
        .orchestrator
        .list_project_results(project_id)
        .await
        .map_err(|e| state.observe(e))?;
    Ok(Json(results))
}

pub fn project_routes() -> Router<AppState> {
    Router::new().route("/projects/:id/results", get(project_results))
}
