//! trayve-pipeline library interface
//!
//! Exposes the orchestrator, ledger and HTTP router for the binary and for
//! integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, PipelineError, PipelineResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use trayve_common::events::EventBus;

use crate::services::PipelineOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last internal error, reported by `/health`
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self {
            db,
            event_bus,
            orchestrator,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Convert a service error for the response, remembering internal ones
    pub fn observe(&self, err: PipelineError) -> ApiError {
        let internal = matches!(
            err,
            PipelineError::Ledger(_) | PipelineError::Storage(_) | PipelineError::Common(_)
        );
        if internal {
            if let Ok(mut last_error) = self.last_error.try_write() {
                *last_error = Some(err.to_string());
            }
        }
        ApiError::from(err)
    }
}

/// Build application router
///
/// `artifacts_dir` is served read-only under `/artifacts`.
pub fn build_router(state: AppState, artifacts_dir: &Path) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::execution_routes())
        .merge(api::project_routes())
        .merge(api::credit_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .nest_service("/artifacts", ServeDir::new(artifacts_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
