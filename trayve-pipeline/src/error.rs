//! Error types for trayve-pipeline
//!
//! `PipelineError` is the service-level taxonomy returned by the orchestrator
//! and ledger; `ApiError` maps it onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Orchestrator / ledger error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad request shape (pose count, missing image). No side effects.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Balance too low. Raised before any record is created or any charge.
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    /// The ledger mutation itself failed (datastore unavailable, constraint)
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not legal in the current state (e.g. cancelling a finished execution)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Common(#[from] trayve_common::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Common(trayve_common::Error::Database(err))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Not enough credits (402)
    #[error("Payment required: {0}")]
    PaymentRequired(String),

    /// Conflict (409) - e.g., cancelling a finished execution
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(msg) => ApiError::BadRequest(msg),
            PipelineError::InsufficientCredits { .. } => ApiError::PaymentRequired(err.to_string()),
            PipelineError::NotFound(msg) => ApiError::NotFound(msg),
            PipelineError::InvalidState(msg) => ApiError::Conflict(msg),
            PipelineError::Ledger(_) | PipelineError::Storage(_) | PipelineError::Common(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::PaymentRequired(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDITS", msg)
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal API error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
