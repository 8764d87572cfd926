//! Credit ledger service
//!
//! Wraps the ledger statements in `db::credits` with the service error
//! taxonomy. Insufficient balance is a typed outcome, never a panic.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::credits::{self, ConsumeOutcome, CreditOutcome, LedgerEntry};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CreditBalance, CreditTransaction};

/// Merchant credit accounts
#[derive(Clone)]
pub struct CreditLedger {
    db: SqlitePool,
}

impl CreditLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Current balance; an unknown user has an empty balance
    pub async fn get_balance(&self, user_id: &str) -> PipelineResult<CreditBalance> {
        Ok(credits::get_balance(&self.db, user_id)
            .await?
            .unwrap_or_else(|| CreditBalance::new(0, 0)))
    }

    /// Advisory check; the authoritative check is inside `reserve_and_consume`
    pub async fn has_sufficient(&self, user_id: &str, amount: i64) -> PipelineResult<bool> {
        Ok(self.get_balance(user_id).await?.available >= amount)
    }

    /// Atomically debit `amount`, failing with `InsufficientCredits` if the
    /// balance does not cover it
    pub async fn reserve_and_consume(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        feature_type: &str,
        reference: Option<&str>,
    ) -> PipelineResult<CreditBalance> {
        validate_amount(amount)?;

        let entry = LedgerEntry {
            user_id,
            amount,
            description,
            feature_type,
            reference,
        };

        let outcome = credits::consume(&self.db, &entry).await;
        consume_result(&entry, outcome)
    }

    /// Debit the batch cost of a `pending` execution and move it to
    /// `processing` in the same transaction
    ///
    /// Fails with `InvalidState` when the execution already left `pending`
    /// (cancelled or recovered before payment); nothing is charged then.
    pub async fn charge_execution(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        execution_id: Uuid,
    ) -> PipelineResult<CreditBalance> {
        validate_amount(amount)?;

        let reference = execution_id.to_string();
        let entry = LedgerEntry {
            user_id,
            amount,
            description,
            feature_type: crate::models::credit::FEATURE_GENERATION,
            reference: Some(&reference),
        };

        let outcome = credits::consume_for_execution(&self.db, &entry, execution_id).await;
        consume_result(&entry, outcome)
    }

    /// Return previously consumed credits, tagged with the originating reference
    pub async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference: &str,
    ) -> PipelineResult<CreditBalance> {
        validate_amount(amount)?;

        let entry = LedgerEntry {
            user_id,
            amount,
            description: reason,
            feature_type: crate::models::credit::FEATURE_REFUND,
            reference: Some(reference),
        };

        match credits::refund(&self.db, &entry).await {
            Ok(CreditOutcome::Credited(balance)) => {
                tracing::info!(
                    user_id,
                    amount,
                    reference,
                    available = balance.available,
                    "Credits refunded"
                );
                Ok(balance)
            }
            Ok(CreditOutcome::ExceedsConsumed { used }) => Err(PipelineError::Ledger(format!(
                "Refund of {} exceeds consumed credits ({}) for {}",
                amount, used, user_id
            ))),
            Ok(CreditOutcome::NoAccount) => Err(PipelineError::Ledger(format!(
                "No credit account for {}",
                user_id
            ))),
            Ok(CreditOutcome::WouldOverflow { .. }) => Err(PipelineError::Ledger(
                "Unexpected refund outcome".to_string(),
            )),
            Err(e) => Err(PipelineError::Ledger(e.to_string())),
        }
    }

    /// Create the account with its welcome grant if it does not exist yet
    ///
    /// Returns the balance either way.
    pub async fn ensure_account(
        &self,
        user_id: &str,
        welcome_credits: i64,
    ) -> PipelineResult<CreditBalance> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::Validation("user_id must not be empty".to_string()));
        }

        let created = credits::create_account_if_missing(&self.db, user_id, welcome_credits.max(0))
            .await
            .map_err(|e| PipelineError::Ledger(e.to_string()))?;
        if created {
            tracing::info!(user_id, welcome_credits, "Credit account created");
        }

        self.get_balance(user_id).await
    }

    /// Add purchased or granted credits
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        feature_type: &str,
    ) -> PipelineResult<CreditBalance> {
        validate_amount(amount)?;

        let entry = LedgerEntry {
            user_id,
            amount,
            description,
            feature_type,
            reference: None,
        };

        match credits::grant(&self.db, &entry).await {
            Ok(CreditOutcome::Credited(balance)) => Ok(balance),
            Ok(CreditOutcome::NoAccount) => Err(PipelineError::NotFound(format!(
                "Credit account {}",
                user_id
            ))),
            Ok(CreditOutcome::WouldOverflow { total }) => Err(PipelineError::Validation(format!(
                "Grant of {} would exceed the maximum balance (current total {})",
                amount, total
            ))),
            Ok(CreditOutcome::ExceedsConsumed { .. }) => Err(PipelineError::Ledger(
                "Unexpected grant outcome".to_string(),
            )),
            Err(e) => Err(PipelineError::Ledger(e.to_string())),
        }
    }

    /// Newest-first transaction history
    pub async fn transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> PipelineResult<Vec<CreditTransaction>> {
        Ok(credits::list_transactions(&self.db, user_id, limit.clamp(1, 500)).await?)
    }
}

fn consume_result(
    entry: &LedgerEntry<'_>,
    outcome: trayve_common::Result<ConsumeOutcome>,
) -> PipelineResult<CreditBalance> {
    let user_id = entry.user_id;
    let amount = entry.amount;

    match outcome {
        Ok(ConsumeOutcome::Consumed(balance)) => {
            tracing::info!(
                user_id,
                amount,
                available = balance.available,
                feature_type = entry.feature_type,
                "Credits consumed"
            );
            Ok(balance)
        }
        Ok(ConsumeOutcome::Insufficient { available }) => {
            tracing::info!(user_id, amount, available, "Insufficient credits");
            Err(PipelineError::InsufficientCredits {
                required: amount,
                available,
            })
        }
        Ok(ConsumeOutcome::NoAccount) => Err(PipelineError::InsufficientCredits {
            required: amount,
            available: 0,
        }),
        Ok(ConsumeOutcome::ExecutionNotPending) => Err(PipelineError::InvalidState(format!(
            "Execution {} is no longer awaiting payment",
            entry.reference.unwrap_or_default()
        ))),
        Err(e) => {
            tracing::error!(user_id, amount, error = %e, "Credit debit failed");
            Err(PipelineError::Ledger(e.to_string()))
        }
    }
}

fn validate_amount(amount: i64) -> PipelineResult<()> {
    if amount <= 0 {
        return Err(PipelineError::Validation(format!(
            "Credit amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credit::FEATURE_GENERATION;
    use crate::models::TransactionKind;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, CreditLedger) {
        let dir = TempDir::new().unwrap();
        let pool = trayve_common::db::init_database(&dir.path().join("ledger.db"))
            .await
            .unwrap();
        (dir, CreditLedger::new(pool))
    }

    #[tokio::test]
    async fn test_unknown_user_has_empty_balance() {
        let (_dir, ledger) = setup().await;
        let balance = ledger.get_balance("nobody").await.unwrap();
        assert_eq!(balance, CreditBalance::new(0, 0));
        assert!(!ledger.has_sufficient("nobody", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_account_is_idempotent() {
        let (_dir, ledger) = setup().await;

        let first = ledger.ensure_account("alice", 5000).await.unwrap();
        let second = ledger.ensure_account("alice", 5000).await.unwrap();

        assert_eq!(first.total, 5000);
        assert_eq!(second.total, 5000);

        let history = ledger.transactions("alice", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::Credit);
        assert_eq!(history[0].feature_type, "welcome");
    }

    #[tokio::test]
    async fn test_consume_and_refund() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("alice", 5000).await.unwrap();

        let after_debit = ledger
            .reserve_and_consume("alice", 2000, "2 images", FEATURE_GENERATION, Some("exec-1"))
            .await
            .unwrap();
        assert_eq!(after_debit.available, 3000);
        assert_eq!(after_debit.used, 2000);

        let after_refund = ledger
            .refund("alice", 1000, "1 failed generation(s)", "exec-1")
            .await
            .unwrap();
        assert_eq!(after_refund.available, 4000);
        assert_eq!(after_refund.used, 1000);

        let tagged = credits::list_transactions_for_reference(&ledger.db, "exec-1")
            .await
            .unwrap();
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged[0].kind, TransactionKind::Debit);
        assert_eq!(tagged[1].kind, TransactionKind::Credit);
        assert_eq!(tagged[1].description, "1 failed generation(s)");
    }

    #[tokio::test]
    async fn test_insufficient_credits_leaves_balance_untouched() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("bob", 500).await.unwrap();

        let err = ledger
            .reserve_and_consume("bob", 3000, "3 images", FEATURE_GENERATION, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientCredits {
                required: 3000,
                available: 500
            }
        ));

        let balance = ledger.get_balance("bob").await.unwrap();
        assert_eq!(balance.available, 500);
        assert_eq!(balance.used, 0);
    }

    #[tokio::test]
    async fn test_refund_cannot_exceed_consumed() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("carol", 1000).await.unwrap();

        let err = ledger.refund("carol", 500, "bogus", "exec-x").await.unwrap_err();
        assert!(matches!(err, PipelineError::Ledger(_)));
        assert_eq!(ledger.get_balance("carol").await.unwrap().available, 1000);
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("dave", 1000).await.unwrap();

        assert!(matches!(
            ledger
                .reserve_and_consume("dave", 0, "zero", FEATURE_GENERATION, None)
                .await,
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            ledger.refund("dave", -5, "negative", "exec").await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_increases_total() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("erin", 0).await.unwrap();

        let balance = ledger
            .grant("erin", 10_000, "Starter plan", "plan_purchase")
            .await
            .unwrap();
        assert_eq!(balance.total, 10_000);
        assert_eq!(balance.available, 10_000);

        assert!(matches!(
            ledger.grant("ghost", 100, "x", "plan_purchase").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_past_max_balance_is_rejected() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("frank", 1000).await.unwrap();

        let err = ledger
            .grant("frank", i64::MAX - 5, "Enterprise plan", "plan_purchase")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let balance = ledger.get_balance("frank").await.unwrap();
        assert_eq!(balance.total, 1000);
        assert_eq!(ledger.transactions("frank", 10).await.unwrap().len(), 1);

        // Exactly reaching the maximum is still allowed
        let balance = ledger
            .grant("frank", i64::MAX - 1000, "Enterprise plan", "plan_purchase")
            .await
            .unwrap();
        assert_eq!(balance.total, i64::MAX);
    }

    #[tokio::test]
    async fn test_net_debited_tracks_refunds_per_reference() {
        let (_dir, ledger) = setup().await;
        ledger.ensure_account("gina", 5000).await.unwrap();

        assert_eq!(credits::net_debited(&ledger.db, "exec-9").await.unwrap(), 0);

        ledger
            .reserve_and_consume("gina", 3000, "3 images", FEATURE_GENERATION, Some("exec-9"))
            .await
            .unwrap();
        ledger.refund("gina", 1000, "1 failed generation(s)", "exec-9").await.unwrap();

        assert_eq!(credits::net_debited(&ledger.db, "exec-9").await.unwrap(), 2000);
    }
}
