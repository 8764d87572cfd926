//! Project persistence

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use trayve_common::Result;
use uuid::Uuid;

use super::{parse_enum, parse_timestamp, parse_uuid};
use crate::models::Project;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

pub async fn insert_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    let id = project.id.to_string();
    let created_at = project.created_at.to_rfc3339();
    let updated_at = project.updated_at.to_rfc3339();

    retry_on_lock("insert_project", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO projects (id, user_id, name, status, result_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&project.user_id)
        .bind(&project.name)
        .bind(project.status.as_str())
        .bind(project.result_count)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

pub async fn load_project(pool: &SqlitePool, project_id: Uuid) -> Result<Option<Project>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, name, status, result_count, created_at, updated_at
        FROM projects
        WHERE id = ?
        "#,
    )
    .bind(project_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_project).transpose()
}

/// Reopen an archived project for another execution
pub async fn reactivate_project(pool: &SqlitePool, project_id: Uuid) -> Result<()> {
    let id = project_id.to_string();
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("reactivate_project", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query("UPDATE projects SET status = 'active', updated_at = ? WHERE id = ?")
            .bind(&updated_at)
            .bind(&id)
            .execute(pool)
            .await?;

        Ok(())
    })
    .await
}

/// Refresh the completed-result count and archive the project once no
/// execution on it is still running
///
/// Returns whether the project is now archived.
pub async fn archive_project(pool: &SqlitePool, project_id: Uuid) -> Result<bool> {
    let id = project_id.to_string();
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("archive_project", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let row = sqlx::query(
            r#"
            UPDATE projects
            SET status = CASE
                    WHEN EXISTS (
                        SELECT 1 FROM executions
                        WHERE project_id = projects.id
                          AND status IN ('pending', 'processing')
                    ) THEN status
                    ELSE 'archived'
                END,
                result_count = (
                    SELECT COUNT(*) FROM generation_results
                    WHERE project_id = projects.id AND status = 'completed'
                ),
                updated_at = ?
            WHERE id = ?
            RETURNING status
            "#,
        )
        .bind(&updated_at)
        .bind(&id)
        .fetch_optional(pool)
        .await?;

        Ok(match row {
            Some(row) => row.try_get::<String, _>("status")? == "archived",
            None => false,
        })
    })
    .await
}

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Project {
        id: parse_uuid("id", &id)?,
        user_id: row.get("user_id"),
        name: row.get("name"),
        status: parse_enum(&status)?,
        result_count: row.get("result_count"),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}
