//! Database access for trayve-pipeline
//!
//! Every status-changing statement is conditional on the row's current
//! status (`WHERE status = 'processing'`) and reports whether it applied, so
//! concurrent writers (background task, cancel request, crash recovery)
//! cannot overwrite each other's terminal state.

pub mod credits;
pub mod executions;
pub mod projects;
pub mod refunds;
pub mod results;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use trayve_common::{Error, Result};
use uuid::Uuid;

/// Open the shared database and make sure the schema exists
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    trayve_common::db::init_database(db_path).await
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Failed to parse {} '{}': {}", column, value, e)))
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(Error::Internal)
}
