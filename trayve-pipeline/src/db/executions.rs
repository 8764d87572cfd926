//! Execution persistence

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use trayve_common::{Error, Result};
use uuid::Uuid;

use super::{parse_enum, parse_optional_timestamp, parse_timestamp, parse_uuid};
use crate::models::{Execution, ExecutionStatus, StepType};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, project_id, tier, status, enabled_steps, progress,
           credits_reserved, credits_used, started_at, completed_at, error
    FROM executions
"#;

pub async fn insert_execution(pool: &SqlitePool, execution: &Execution) -> Result<()> {
    let enabled_steps = serde_json::to_string(&execution.enabled_steps)
        .map_err(|e| Error::Internal(format!("Failed to serialize enabled_steps: {}", e)))?;
    let id = execution.id.to_string();
    let project_id = execution.project_id.to_string();
    let started_at = execution.started_at.to_rfc3339();
    let completed_at = execution.completed_at.map(|dt| dt.to_rfc3339());

    retry_on_lock("insert_execution", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, user_id, project_id, tier, status, enabled_steps, progress,
                credits_reserved, credits_used, started_at, completed_at, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&execution.user_id)
        .bind(&project_id)
        .bind(execution.tier.as_str())
        .bind(execution.status.as_str())
        .bind(&enabled_steps)
        .bind(execution.progress)
        .bind(execution.credits_reserved)
        .bind(execution.credits_used)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(&execution.error)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

pub async fn load_execution(pool: &SqlitePool, execution_id: Uuid) -> Result<Option<Execution>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
        .bind(execution_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_execution).transpose()
}

/// Executions currently in `status`, oldest first
pub async fn list_by_status(pool: &SqlitePool, status: ExecutionStatus) -> Result<Vec<Execution>> {
    let rows = sqlx::query(&format!(
        "{} WHERE status = ? ORDER BY started_at ASC",
        SELECT_COLUMNS
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_execution).collect()
}

/// Raise progress; never lowers it and never touches a terminal execution
pub async fn update_progress(pool: &SqlitePool, execution_id: Uuid, progress: i64) -> Result<bool> {
    let id = execution_id.to_string();
    let progress = progress.clamp(0, 100);

    retry_on_lock("update_execution_progress", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET progress = MAX(progress, ?)
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(progress)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    })
    .await
}

/// Move a `processing` execution to a terminal status
///
/// Returns false when the execution was no longer `processing` (another
/// writer got there first); in that case nothing changed.
pub async fn finish_execution(
    pool: &SqlitePool,
    execution_id: Uuid,
    status: ExecutionStatus,
    credits_used: i64,
    progress: Option<i64>,
    error: Option<&str>,
) -> Result<bool> {
    if !ExecutionStatus::Processing.can_transition_to(status) {
        return Err(Error::Internal(format!(
            "Illegal execution transition processing -> {}",
            status
        )));
    }

    let id = execution_id.to_string();
    let completed_at = Utc::now().to_rfc3339();

    retry_on_lock("finish_execution", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?,
                credits_used = ?,
                progress = COALESCE(?, progress),
                completed_at = ?,
                error = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(credits_used)
        .bind(progress)
        .bind(&completed_at)
        .bind(error)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    })
    .await
}

/// Close a `pending` execution that was never paid for
///
/// Returns false when the execution had already left `pending` (its debit
/// committed, or another writer closed it).
pub async fn abandon_pending_execution(
    pool: &SqlitePool,
    execution_id: Uuid,
    status: ExecutionStatus,
    error: Option<&str>,
) -> Result<bool> {
    if !ExecutionStatus::Pending.can_transition_to(status) || !status.is_terminal() {
        return Err(Error::Internal(format!(
            "Illegal execution transition pending -> {}",
            status
        )));
    }

    let id = execution_id.to_string();
    let completed_at = Utc::now().to_rfc3339();

    retry_on_lock("abandon_pending_execution", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, credits_used = 0, completed_at = ?, error = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(&completed_at)
        .bind(error)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    })
    .await
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let tier: String = row.get("tier");
    let status: String = row.get("status");
    let enabled_steps: String = row.get("enabled_steps");
    let enabled_steps: Vec<StepType> = serde_json::from_str(&enabled_steps)
        .map_err(|e| Error::Internal(format!("Failed to deserialize enabled_steps: {}", e)))?;
    let started_at: String = row.get("started_at");

    Ok(Execution {
        id: parse_uuid("id", &id)?,
        user_id: row.get("user_id"),
        project_id: parse_uuid("project_id", &project_id)?,
        tier: parse_enum(&tier)?,
        status: parse_enum(&status)?,
        enabled_steps,
        progress: row.get("progress"),
        credits_reserved: row.get("credits_reserved"),
        credits_used: row.get("credits_used"),
        started_at: parse_timestamp("started_at", &started_at)?,
        completed_at: parse_optional_timestamp("completed_at", row.get("completed_at"))?,
        error: row.get("error"),
    })
}
