//! Tests for database initialization

use tempfile::TempDir;
use trayve_common::db::init::{create_schema, init_database};

const EXPECTED_TABLES: &[&str] = &[
    "credit_accounts",
    "credit_transactions",
    "executions",
    "generation_results",
    "pending_refunds",
    "projects",
];

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("sub").join("trayve.db");

    let pool = init_database(&db_path).await.expect("init failed");
    assert!(db_path.exists(), "Database file was not created");

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    for table in EXPECTED_TABLES {
        assert!(tables.iter().any(|t| t == table), "missing table {}", table);
    }
}

#[tokio::test]
async fn test_schema_creation_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("trayve.db");

    let pool = init_database(&db_path).await.unwrap();
    create_schema(&pool).await.expect("second schema creation failed");
    pool.close().await;

    // Reopening an existing database also succeeds
    init_database(&db_path).await.expect("reopen failed");
}

#[tokio::test]
async fn test_balance_check_constraint_rejects_overdraft() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("trayve.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO credit_accounts (user_id, total_credits, used_credits, created_at, updated_at)
         VALUES ('shop-1', 100, 200, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "used_credits > total_credits must be rejected");
}
