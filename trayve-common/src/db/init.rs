//! Database initialization
//!
//! Opens (creating if needed) the shared SQLite database and creates every
//! table idempotently. Safe to call on each startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Busy timeout applied to every pooled connection
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open the database at `db_path` and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL keeps readers (status pollers) off the writer's back
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_credit_accounts_table(pool).await?;
    create_credit_transactions_table(pool).await?;
    create_projects_table(pool).await?;
    create_executions_table(pool).await?;
    create_generation_results_table(pool).await?;
    create_pending_refunds_table(pool).await?;

    info!("Database schema initialized");
    Ok(())
}

/// One row per merchant; balance columns only change through ledger statements
pub async fn create_credit_accounts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credit_accounts (
            user_id TEXT PRIMARY KEY,
            total_credits INTEGER NOT NULL DEFAULT 0 CHECK (total_credits >= 0),
            used_credits INTEGER NOT NULL DEFAULT 0 CHECK (used_credits >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (used_credits <= total_credits)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only log of every ledger mutation
pub async fn create_credit_transactions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credit_transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES credit_accounts(user_id),
            kind TEXT NOT NULL CHECK (kind IN ('credit', 'debit')),
            amount INTEGER NOT NULL CHECK (amount > 0),
            description TEXT NOT NULL,
            feature_type TEXT NOT NULL,
            reference TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_credit_transactions_user ON credit_transactions(user_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_credit_transactions_reference ON credit_transactions(reference)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_projects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'archived')),
            result_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_executions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            tier TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
            enabled_steps TEXT NOT NULL DEFAULT '[]',
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            credits_reserved INTEGER NOT NULL DEFAULT 0,
            credits_used INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error TEXT,
            CHECK (credits_used <= credits_reserved)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn create_generation_results_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generation_results (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            pose_index INTEGER NOT NULL,
            pose_id TEXT NOT NULL,
            pose_name TEXT NOT NULL,
            model_image_url TEXT NOT NULL,
            clothing_image_url TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('processing', 'completed', 'failed', 'cancelled')),
            final_image_url TEXT,
            step_results TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_generation_results_execution ON generation_results(execution_id, pose_index)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Refunds that could not be applied and wait for manual adjustment
pub async fn create_pending_refunds_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_refunds (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            reason TEXT NOT NULL,
            error TEXT NOT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
