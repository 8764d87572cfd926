//! Credit ledger statements
//!
//! Balance columns are only ever changed by a single conditional UPDATE
//! (guarded in SQL, never read-then-write from Rust), and the matching
//! `credit_transactions` row is written in the same database transaction.

use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use trayve_common::Result;
use uuid::Uuid;

use super::{parse_enum, parse_timestamp, parse_uuid};
use crate::models::{CreditBalance, CreditTransaction, TransactionKind};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Outcome of an attempted debit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Debited; balance after the debit
    Consumed(CreditBalance),
    /// Nothing changed; balance was too low
    Insufficient { available: i64 },
    /// Nothing changed; the user has no credit account
    NoAccount,
    /// Nothing changed; the execution being paid for is no longer `pending`
    ExecutionNotPending,
}

/// Outcome of a credit (refund or grant)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited(CreditBalance),
    /// A refund larger than the consumed credits would drive `used` negative
    ExceedsConsumed { used: i64 },
    /// A grant would push `total_credits` past `i64::MAX`
    WouldOverflow { total: i64 },
    NoAccount,
}

/// Ledger transaction description; grouped to keep argument lists short
#[derive(Debug, Clone, Copy)]
pub struct LedgerEntry<'a> {
    pub user_id: &'a str,
    pub amount: i64,
    pub description: &'a str,
    pub feature_type: &'a str,
    pub reference: Option<&'a str>,
}

pub async fn get_balance(pool: &SqlitePool, user_id: &str) -> Result<Option<CreditBalance>> {
    let row = sqlx::query(
        "SELECT total_credits, used_credits FROM credit_accounts WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_balance).transpose()
}

fn row_to_balance(row: &sqlx::sqlite::SqliteRow) -> Result<CreditBalance> {
    Ok(CreditBalance::new(
        row.try_get("total_credits")?,
        row.try_get("used_credits")?,
    ))
}

/// Create the account with a welcome grant; returns false if it already existed
pub async fn create_account_if_missing(
    pool: &SqlitePool,
    user_id: &str,
    welcome_credits: i64,
) -> Result<bool> {
    retry_on_lock("create_credit_account", DEFAULT_MAX_LOCK_WAIT_MS, || {
        create_account_once(pool, user_id, welcome_credits)
    })
    .await
}

async fn create_account_once(pool: &SqlitePool, user_id: &str, welcome_credits: i64) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO credit_accounts (user_id, total_credits, used_credits, created_at, updated_at)
        VALUES (?, ?, 0, ?, ?)
        ON CONFLICT(user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(welcome_credits)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted && welcome_credits > 0 {
        let entry = LedgerEntry {
            user_id,
            amount: welcome_credits,
            description: "Welcome credits",
            feature_type: crate::models::credit::FEATURE_WELCOME,
            reference: None,
        };
        insert_transaction(&mut tx, TransactionKind::Credit, &entry).await?;
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Atomically debit `amount` if the available balance covers it
pub async fn consume(pool: &SqlitePool, entry: &LedgerEntry<'_>) -> Result<ConsumeOutcome> {
    retry_on_lock("consume_credits", DEFAULT_MAX_LOCK_WAIT_MS, || {
        consume_once(pool, entry, None)
    })
    .await
}

/// Debit the cost of a `pending` execution and move it to `processing`
///
/// Both writes commit together or not at all, so a `processing` execution
/// has always been paid for and a `pending` one never has.
pub async fn consume_for_execution(
    pool: &SqlitePool,
    entry: &LedgerEntry<'_>,
    execution_id: Uuid,
) -> Result<ConsumeOutcome> {
    let execution_id = execution_id.to_string();
    retry_on_lock("consume_for_execution", DEFAULT_MAX_LOCK_WAIT_MS, || {
        consume_once(pool, entry, Some(execution_id.as_str()))
    })
    .await
}

async fn consume_once(
    pool: &SqlitePool,
    entry: &LedgerEntry<'_>,
    activate_execution: Option<&str>,
) -> Result<ConsumeOutcome> {
    let mut tx = pool.begin().await?;

    if let Some(execution_id) = activate_execution {
        let activated = sqlx::query(
            "UPDATE executions SET status = 'processing' WHERE id = ? AND status = 'pending'",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !activated {
            tx.rollback().await?;
            return Ok(ConsumeOutcome::ExecutionNotPending);
        }
    }

    // The WHERE clause is the balance check: two concurrent debits cannot both pass it
    let row = sqlx::query(
        r#"
        UPDATE credit_accounts
        SET used_credits = used_credits + ?, updated_at = ?
        WHERE user_id = ? AND total_credits - used_credits >= ?
        RETURNING total_credits, used_credits
        "#,
    )
    .bind(entry.amount)
    .bind(Utc::now().to_rfc3339())
    .bind(entry.user_id)
    .bind(entry.amount)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(match get_balance(pool, entry.user_id).await? {
            Some(balance) => ConsumeOutcome::Insufficient {
                available: balance.available,
            },
            None => ConsumeOutcome::NoAccount,
        });
    };

    let balance = row_to_balance(&row)?;
    insert_transaction(&mut tx, TransactionKind::Debit, entry).await?;
    tx.commit().await?;

    Ok(ConsumeOutcome::Consumed(balance))
}

/// Return previously consumed credits
pub async fn refund(pool: &SqlitePool, entry: &LedgerEntry<'_>) -> Result<CreditOutcome> {
    retry_on_lock("refund_credits", DEFAULT_MAX_LOCK_WAIT_MS, || {
        refund_once(pool, entry)
    })
    .await
}

async fn refund_once(pool: &SqlitePool, entry: &LedgerEntry<'_>) -> Result<CreditOutcome> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        UPDATE credit_accounts
        SET used_credits = used_credits - ?, updated_at = ?
        WHERE user_id = ? AND used_credits >= ?
        RETURNING total_credits, used_credits
        "#,
    )
    .bind(entry.amount)
    .bind(Utc::now().to_rfc3339())
    .bind(entry.user_id)
    .bind(entry.amount)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(match get_balance(pool, entry.user_id).await? {
            Some(balance) => CreditOutcome::ExceedsConsumed { used: balance.used },
            None => CreditOutcome::NoAccount,
        });
    };

    let balance = row_to_balance(&row)?;
    insert_transaction(&mut tx, TransactionKind::Credit, entry).await?;
    tx.commit().await?;

    Ok(CreditOutcome::Credited(balance))
}

/// Add newly granted credits (plan purchase, top-up)
pub async fn grant(pool: &SqlitePool, entry: &LedgerEntry<'_>) -> Result<CreditOutcome> {
    retry_on_lock("grant_credits", DEFAULT_MAX_LOCK_WAIT_MS, || {
        grant_once(pool, entry)
    })
    .await
}

async fn grant_once(pool: &SqlitePool, entry: &LedgerEntry<'_>) -> Result<CreditOutcome> {
    let mut tx = pool.begin().await?;

    // `amount` is positive, so `i64::MAX - amount` cannot overflow
    let row = sqlx::query(
        r#"
        UPDATE credit_accounts
        SET total_credits = total_credits + ?, updated_at = ?
        WHERE user_id = ? AND total_credits <= ? - ?
        RETURNING total_credits, used_credits
        "#,
    )
    .bind(entry.amount)
    .bind(Utc::now().to_rfc3339())
    .bind(entry.user_id)
    .bind(i64::MAX)
    .bind(entry.amount)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(match get_balance(pool, entry.user_id).await? {
            Some(balance) => CreditOutcome::WouldOverflow {
                total: balance.total,
            },
            None => CreditOutcome::NoAccount,
        });
    };

    let balance = row_to_balance(&row)?;
    insert_transaction(&mut tx, TransactionKind::Credit, entry).await?;
    tx.commit().await?;

    Ok(CreditOutcome::Credited(balance))
}

async fn insert_transaction(
    tx: &mut Transaction<'_, Sqlite>,
    kind: TransactionKind,
    entry: &LedgerEntry<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_transactions (
            id, user_id, kind, amount, description, feature_type, reference, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(entry.user_id)
    .bind(kind.as_str())
    .bind(entry.amount)
    .bind(entry.description)
    .bind(entry.feature_type)
    .bind(entry.reference)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Newest-first transaction history for one account
pub async fn list_transactions(
    pool: &SqlitePool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<CreditTransaction>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, kind, amount, description, feature_type, reference, created_at
        FROM credit_transactions
        WHERE user_id = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_transaction).collect()
}

/// Debits minus credits tagged with `reference`; what is still held for it
pub async fn net_debited(pool: &SqlitePool, reference: &str) -> Result<i64> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(CASE kind WHEN 'debit' THEN amount ELSE -amount END), 0) AS net
        FROM credit_transactions
        WHERE reference = ?
        "#,
    )
    .bind(reference)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get("net")?)
}

/// All transactions tagged with a reference (e.g. one execution), oldest first
pub async fn list_transactions_for_reference(
    pool: &SqlitePool,
    reference: &str,
) -> Result<Vec<CreditTransaction>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, kind, amount, description, feature_type, reference, created_at
        FROM credit_transactions
        WHERE reference = ?
        ORDER BY rowid ASC
        "#,
    )
    .bind(reference)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_transaction).collect()
}

fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<CreditTransaction> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let created_at: String = row.get("created_at");

    Ok(CreditTransaction {
        id: parse_uuid("id", &id)?,
        user_id: row.get("user_id"),
        kind: parse_enum(&kind)?,
        amount: row.get("amount"),
        description: row.get("description"),
        feature_type: row.get("feature_type"),
        reference: row.get("reference"),
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
