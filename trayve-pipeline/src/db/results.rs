//! Generation result (per-pose) persistence

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use trayve_common::{Error, Result};
use uuid::Uuid;

use super::{parse_enum, parse_timestamp, parse_uuid};
use crate::models::{GenerationResult, ResultStatus, StepOutcome};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const SELECT_COLUMNS: &str = r#"
    SELECT id, execution_id, project_id, pose_index, pose_id, pose_name,
           model_image_url, clothing_image_url, status, final_image_url,
           step_results, error, created_at, updated_at
    FROM generation_results
"#;

/// Per-status row counts for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultCounts {
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ResultCounts {
    pub fn total(&self) -> usize {
        self.processing + self.completed + self.failed + self.cancelled
    }

    /// Completed + failed, the numerator of execution progress
    pub fn resolved(&self) -> usize {
        self.completed + self.failed
    }
}

/// Insert all placeholder rows of an execution in one transaction
pub async fn insert_results(pool: &SqlitePool, results: &[GenerationResult]) -> Result<()> {
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push((result, serialize_step_results(&result.step_results)?));
    }

    retry_on_lock("insert_generation_results", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        for (result, step_results) in &rows {
            sqlx::query(
                r#"
                INSERT INTO generation_results (
                    id, execution_id, project_id, pose_index, pose_id, pose_name,
                    model_image_url, clothing_image_url, status, final_image_url,
                    step_results, error, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(result.id.to_string())
            .bind(result.execution_id.to_string())
            .bind(result.project_id.to_string())
            .bind(result.pose_index)
            .bind(&result.pose_id)
            .bind(&result.pose_name)
            .bind(&result.model_image_url)
            .bind(&result.clothing_image_url)
            .bind(result.status.as_str())
            .bind(&result.final_image_url)
            .bind(step_results)
            .bind(&result.error)
            .bind(result.created_at.to_rfc3339())
            .bind(result.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Results of one execution in pose order
pub async fn load_results_for_execution(
    pool: &SqlitePool,
    execution_id: Uuid,
) -> Result<Vec<GenerationResult>> {
    let rows = sqlx::query(&format!(
        "{} WHERE execution_id = ? ORDER BY pose_index ASC",
        SELECT_COLUMNS
    ))
    .bind(execution_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_result).collect()
}

/// Results of a project, newest execution first
pub async fn load_results_for_project(
    pool: &SqlitePool,
    project_id: Uuid,
) -> Result<Vec<GenerationResult>> {
    let rows = sqlx::query(&format!(
        "{} WHERE project_id = ? ORDER BY created_at DESC, pose_index ASC",
        SELECT_COLUMNS
    ))
    .bind(project_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_result).collect()
}

/// Persist intermediate step progress of a still-processing pose
pub async fn save_step_progress(pool: &SqlitePool, result: &GenerationResult) -> Result<bool> {
    let step_results = serialize_step_results(&result.step_results)?;
    let id = result.id.to_string();
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("save_step_progress", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let outcome = sqlx::query(
            r#"
            UPDATE generation_results
            SET step_results = ?, final_image_url = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(&step_results)
        .bind(&result.final_image_url)
        .bind(&updated_at)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    })
    .await
}

/// Move a `processing` pose to its terminal status
///
/// Returns false if the pose was already resolved (e.g. cancelled meanwhile).
pub async fn resolve_result(
    pool: &SqlitePool,
    result: &GenerationResult,
    status: ResultStatus,
) -> Result<bool> {
    if !status.is_terminal() {
        return Err(Error::Internal(format!(
            "Cannot resolve generation result to {}",
            status
        )));
    }

    let step_results = serialize_step_results(&result.step_results)?;
    let id = result.id.to_string();
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("resolve_generation_result", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let outcome = sqlx::query(
            r#"
            UPDATE generation_results
            SET status = ?, step_results = ?, final_image_url = ?, error = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(&step_results)
        .bind(&result.final_image_url)
        .bind(&result.error)
        .bind(&updated_at)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    })
    .await
}

/// Bulk-resolve every still-processing pose of an execution
///
/// Used by cancellation (`Cancelled`), failed payment and crash recovery
/// (`Failed`). Returns the number of rows changed.
pub async fn resolve_processing_results(
    pool: &SqlitePool,
    execution_id: Uuid,
    status: ResultStatus,
    error: Option<&str>,
) -> Result<u64> {
    let id = execution_id.to_string();
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("resolve_processing_results", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let outcome = sqlx::query(
            r#"
            UPDATE generation_results
            SET status = ?, error = COALESCE(?, error), updated_at = ?
            WHERE execution_id = ? AND status = 'processing'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&updated_at)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(outcome.rows_affected())
    })
    .await
}

/// Count result rows per status, straight from the table
pub async fn count_by_status(pool: &SqlitePool, execution_id: Uuid) -> Result<ResultCounts> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM generation_results WHERE execution_id = ? GROUP BY status",
    )
    .bind(execution_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut counts = ResultCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let n = row.get::<i64, _>("n") as usize;
        match parse_enum::<ResultStatus>(&status)? {
            ResultStatus::Processing => counts.processing = n,
            ResultStatus::Completed => counts.completed = n,
            ResultStatus::Failed => counts.failed = n,
            ResultStatus::Cancelled => counts.cancelled = n,
        }
    }

    Ok(counts)
}

fn serialize_step_results(step_results: &BTreeMap<String, StepOutcome>) -> Result<String> {
    serde_json::to_string(step_results)
        .map_err(|e| Error::Internal(format!("Failed to serialize step_results: {}", e)))
}

fn row_to_result(row: &sqlx::sqlite::SqliteRow) -> Result<GenerationResult> {
    let id: String = row.get("id");
    let execution_id: String = row.get("execution_id");
    let project_id: String = row.get("project_id");
    let status: String = row.get("status");
    let step_results: String = row.get("step_results");
    let step_results: BTreeMap<String, StepOutcome> = serde_json::from_str(&step_results)
        .map_err(|e| Error::Internal(format!("Failed to deserialize step_results: {}", e)))?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(GenerationResult {
        id: parse_uuid("id", &id)?,
        execution_id: parse_uuid("execution_id", &execution_id)?,
        project_id: parse_uuid("project_id", &project_id)?,
        pose_index: row.get("pose_index"),
        pose_id: row.get("pose_id"),
        pose_name: row.get("pose_name"),
        model_image_url: row.get("model_image_url"),
        clothing_image_url: row.get("clothing_image_url"),
        status: parse_enum(&status)?,
        final_image_url: row.get("final_image_url"),
        step_results,
        error: row.get("error"),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
