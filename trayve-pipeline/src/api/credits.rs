//! Credit account endpoints

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::refunds::PendingRefund;
use crate::error::ApiResult;
use crate::models::{CreditBalance, CreditTransaction};
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub amount: i64,
    pub description: String,
    #[serde(default = "default_grant_feature")]
    pub feature_type: String,
}

fn default_grant_feature() -> String {
    "plan_purchase".to_string()
}

/// GET /credits/{user_id}
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<CreditBalance>> {
    let balance = state
        .orchestrator
        .ledger()
        .get_balance(&user_id)
        .await
        .map_err(|e| state.observe(e))?;
    Ok(Json(balance))
}

/// POST /credits/{user_id}
///
/// Create the account with the configured welcome credits; idempotent.
pub async fn ensure_account(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<CreditBalance>> {
    let welcome = state.orchestrator.pricing().welcome_credits;
    let balance = state
        .orchestrator
        .ledger()
        .ensure_account(&user_id, welcome)
        .await
        .map_err(|e| state.observe(e))?;
    Ok(Json(balance))
}

/// POST /credits/{user_id}/grants
pub async fn grant_credits(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<GrantRequest>,
) -> ApiResult<Json<CreditBalance>> {
    let balance = state
        .orchestrator
        .ledger()
        .grant(&user_id, request.amount, &request.description, &request.feature_type)
        .await
        .map_err(|e| state.observe(e))?;

    tracing::info!(user_id = %user_id, amount = request.amount, "Credits granted");
    Ok(Json(balance))
}

/// GET /credits/{user_id}/transactions?limit=
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<CreditTransaction>>> {
    let transactions = state
        .orchestrator
        .ledger()
        .transactions(&user_id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await
        .map_err(|e| state.observe(e))?;
    Ok(Json(transactions))
}

/// GET /refunds/pending
pub async fn list_pending_refunds(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PendingRefund>>> {
    let refunds = crate::db::refunds::list_pending_refunds(&state.db)
        .await
        .map_err(|e| state.observe(e.into()))?;
    Ok(Json(refunds))
}

pub fn credit_routes() -> Router<AppState> {
    Router::new()
        .route("/credits/:user_id", get(get_balance).post(ensure_account))
        .route("/credits/:user_id/grants", post(grant_credits))
        .route("/credits/:user_id/transactions", get(list_transactions))
        .route("/refunds/pending", get(list_pending_refunds))
}
