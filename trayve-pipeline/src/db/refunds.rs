//! Refunds that could not be applied and await manual reconciliation

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use trayve_common::Result;
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRefund {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
    /// Ledger error that prevented the refund
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub async fn record_pending_refund(
    pool: &SqlitePool,
    execution_id: Uuid,
    user_id: &str,
    amount: i64,
    reason: &str,
    error: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let id_str = id.to_string();
    let execution_id = execution_id.to_string();
    let created_at = Utc::now().to_rfc3339();

    retry_on_lock("record_pending_refund", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO pending_refunds (id, execution_id, user_id, amount, reason, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id_str)
        .bind(&execution_id)
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .bind(error)
        .bind(&created_at)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await?;

    Ok(id)
}

/// Unresolved refunds, oldest first
pub async fn list_pending_refunds(pool: &SqlitePool) -> Result<Vec<PendingRefund>> {
    let rows = sqlx::query(
        r#"
        SELECT id, execution_id, user_id, amount, reason, error, created_at, resolved_at
        FROM pending_refunds
        WHERE resolved_at IS NULL
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_pending_refund).collect()
}

fn row_to_pending_refund(row: &sqlx::sqlite::SqliteRow) -> Result<PendingRefund> {
    let id: String = row.get("id");
    let execution_id: String = row.get("execution_id");
    let created_at: String = row.get("created_at");

    Ok(PendingRefund {
        id: parse_uuid("id", &id)?,
        execution_id: parse_uuid("execution_id", &execution_id)?,
        user_id: row.get("user_id"),
        amount: row.get("amount"),
        reason: row.get("reason"),
        error: row.get("error"),
        created_at: parse_timestamp("created_at", &created_at)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.get("resolved_at"))?,
    })
}
