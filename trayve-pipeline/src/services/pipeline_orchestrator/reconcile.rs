//! Terminal transitions and ledger reconciliation
//!
//! Every path that ends an execution (natural completion, cancellation,
//! abort/recovery) goes through [`PipelineOrchestrator::finalize`]: count the
//! pose outcomes, apply the conditional terminal update, and only if that
//! update won refund the credits of every pose that produced no image, capped
//! by what the ledger actually holds for the execution.

use chrono::Utc;
use trayve_common::events::TrayveEvent;

use super::{PipelineOrchestrator, ALL_FAILED_MESSAGE};
use crate::db;
use crate::error::PipelineResult;
use crate::models::{Execution, ExecutionStatus, ResultStatus};

/// Result of an attempted terminal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This caller moved the execution to `status` and settled the ledger
    Applied {
        status: ExecutionStatus,
        /// Credits actually returned to the account
        refunded: i64,
    },
    /// Another writer had already finished the execution; nothing changed
    AlreadyFinalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    /// All poses resolved by the background task (or forced failed)
    Natural,
    Cancelled,
}

impl PipelineOrchestrator {
    /// Settle an execution whose poses have all been resolved
    pub(super) async fn reconcile_completed(
        &self,
        execution: &Execution,
    ) -> PipelineResult<ReconcileOutcome> {
        self.finalize(execution, Finish::Natural).await
    }

    /// Settle an execution whose unfinished poses were just marked cancelled
    pub(super) async fn reconcile_cancelled(
        &self,
        execution: &Execution,
    ) -> PipelineResult<ReconcileOutcome> {
        self.finalize(execution, Finish::Cancelled).await
    }

    /// Fail every unfinished pose, then settle normally
    pub(super) async fn abort_execution(
        &self,
        execution: &Execution,
        message: &str,
    ) -> PipelineResult<ReconcileOutcome> {
        let failed = db::results::resolve_processing_results(
            &self.db,
            execution.id,
            ResultStatus::Failed,
            Some(message),
        )
        .await?;
        tracing::warn!(
            execution_id = %execution.id,
            failed_poses = failed,
            reason = message,
            "Unfinished poses marked failed"
        );

        self.finalize(execution, Finish::Natural).await
    }

    async fn finalize(&self, execution: &Execution, finish: Finish) -> PipelineResult<ReconcileOutcome> {
        let counts = db::results::count_by_status(&self.db, execution.id).await?;
        let cost = self.pricing.credits_per_image;

        let credits_used = (counts.completed as i64 * cost).min(execution.credits_reserved);
        let not_generated = counts.total() - counts.completed;

        // Never return more than the ledger still holds for this execution
        let held = db::credits::net_debited(&self.db, &execution.id.to_string()).await?;
        let refund_due = (execution.credits_reserved - credits_used).min(held).max(0);
        if refund_due < execution.credits_reserved - credits_used {
            tracing::warn!(
                execution_id = %execution.id,
                reserved = execution.credits_reserved,
                held,
                "Ledger holds less than the reservation; refund capped"
            );
        }

        let (status, progress, error) = match finish {
            Finish::Cancelled => (ExecutionStatus::Cancelled, None, None),
            Finish::Natural if counts.completed == 0 => {
                (ExecutionStatus::Failed, Some(100), Some(ALL_FAILED_MESSAGE))
            }
            Finish::Natural => (ExecutionStatus::Completed, Some(100), None),
        };

        let won = db::executions::finish_execution(
            &self.db,
            execution.id,
            status,
            credits_used,
            progress,
            error,
        )
        .await?;

        if !won {
            tracing::debug!(
                execution_id = %execution.id,
                attempted = %status,
                "Execution already finalized by another writer"
            );
            return Ok(ReconcileOutcome::AlreadyFinalized);
        }

        let refunded = if refund_due > 0 {
            let reason = match finish {
                Finish::Cancelled => {
                    format!("Execution cancelled: {} pose(s) not generated", not_generated)
                }
                Finish::Natural => format!("{} failed generation(s)", not_generated),
            };
            self.apply_refund(execution, refund_due, &reason).await
        } else {
            0
        };

        if let Err(e) = db::projects::archive_project(&self.db, execution.project_id).await {
            tracing::error!(
                execution_id = %execution.id,
                project_id = %execution.project_id,
                error = %e,
                "Failed to archive project"
            );
        }

        let timestamp = Utc::now();
        let event = match status {
            ExecutionStatus::Cancelled => TrayveEvent::ExecutionCancelled {
                execution_id: execution.id,
                credits_refunded: refunded,
                timestamp,
            },
            ExecutionStatus::Failed => TrayveEvent::ExecutionFailed {
                execution_id: execution.id,
                error: ALL_FAILED_MESSAGE.to_string(),
                timestamp,
            },
            _ => TrayveEvent::ExecutionCompleted {
                execution_id: execution.id,
                completed_poses: counts.completed,
                failed_poses: counts.failed,
                credits_used,
                duration_seconds: (timestamp - execution.started_at).num_seconds().max(0) as u64,
                timestamp,
            },
        };
        self.event_bus.emit_lossy(event);

        tracing::info!(
            execution_id = %execution.id,
            status = %status,
            completed_poses = counts.completed,
            failed_poses = counts.failed,
            cancelled_poses = counts.cancelled,
            credits_used,
            refunded,
            "Execution finalized"
        );

        Ok(ReconcileOutcome::Applied { status, refunded })
    }

    /// Refund and report; a failed refund is parked in `pending_refunds`
    /// and the terminal status stays as applied
    async fn apply_refund(&self, execution: &Execution, amount: i64, reason: &str) -> i64 {
        let reference = execution.id.to_string();

        match self
            .ledger
            .refund(&execution.user_id, amount, reason, &reference)
            .await
        {
            Ok(_) => {
                self.event_bus.emit_lossy(TrayveEvent::CreditsRefunded {
                    execution_id: execution.id,
                    user_id: execution.user_id.clone(),
                    amount,
                    reason: reason.to_string(),
                    timestamp: Utc::now(),
                });
                amount
            }
            Err(e) => {
                tracing::error!(
                    execution_id = %execution.id,
                    user_id = %execution.user_id,
                    amount,
                    error = %e,
                    "Refund failed, recording for manual adjustment"
                );

                if let Err(record_err) = db::refunds::record_pending_refund(
                    &self.db,
                    execution.id,
                    &execution.user_id,
                    amount,
                    reason,
                    &e.to_string(),
                )
                .await
                {
                    tracing::error!(
                        execution_id = %execution.id,
                        user_id = %execution.user_id,
                        amount,
                        error = %record_err,
                        "Pending refund could not be recorded"
                    );
                }

                self.event_bus.emit_lossy(TrayveEvent::RefundFailed {
                    execution_id: execution.id,
                    user_id: execution.user_id.clone(),
                    amount,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                0
            }
        }
    }
}
