//! Generation pipeline orchestrator
//!
//! Drives one execution (a batch of poses for one garment) through the tier's
//! step chain:
//!
//! 1. Validate and check the balance (no side effects on rejection)
//! 2. Create project, a `pending` execution and one placeholder result per pose
//! 3. Debit the full batch cost upfront; the same transaction moves the
//!    execution to `processing`
//! 4. Hand off to a background task (bounded by the worker semaphore) and return
//! 5. Background: poses sequentially (`pose_runner`), then reconcile the
//!    ledger for failed poses (`reconcile`)
//!
//! Status changes are conditional database updates, so completion,
//! cancellation and crash recovery cannot both apply to one execution and only
//! the winner touches the ledger. A `pending` execution was never charged and
//! is closed without a refund.

mod pose_runner;
mod reconcile;

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use trayve_common::events::{EventBus, TrayveEvent};
use uuid::Uuid;

use crate::config::PricingConfig;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Execution, ExecutionRequest, ExecutionStatus, ExecutionStatusReport, GenerationResult,
    Project, ProjectStatus, ResultStatus,
};
use crate::services::artifact_store::ArtifactStore;
use crate::services::credit_ledger::CreditLedger;
use crate::services::providers::ProviderRegistry;
use crate::services::step_chain::{StepChain, StepChainPolicy};

pub use reconcile::ReconcileOutcome;

/// Message stored on results left `processing` by a crashed or aborted task
pub const INTERRUPTED_MESSAGE: &str = "Generation interrupted";

/// Execution error when every pose failed
pub const ALL_FAILED_MESSAGE: &str = "All generations failed. No credits were charged.";

pub struct PipelineOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    ledger: CreditLedger,
    providers: ProviderRegistry,
    artifacts: ArtifactStore,
    chains: StepChainPolicy,
    pricing: PricingConfig,
    worker_permits: Arc<Semaphore>,
    /// Cancellation tokens of executions with a live background task
    cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        providers: ProviderRegistry,
        artifacts: ArtifactStore,
        chains: StepChainPolicy,
        pricing: PricingConfig,
        max_concurrent_executions: usize,
    ) -> Self {
        Self {
            ledger: CreditLedger::new(db.clone()),
            db,
            event_bus,
            providers,
            artifacts,
            chains,
            pricing,
            worker_permits: Arc::new(Semaphore::new(max_concurrent_executions.max(1))),
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Number of executions with a live background task
    pub async fn active_executions(&self) -> usize {
        self.cancellation_tokens.read().await.len()
    }

    /// Validate, debit and start a generation batch
    ///
    /// Returns as soon as the background task is queued; the returned
    /// execution is `processing` with `progress = 0`.
    pub async fn start_execution(
        self: &Arc<Self>,
        request: ExecutionRequest,
    ) -> PipelineResult<Execution> {
        self.validate_request(&request)?;

        let pose_count = request.poses.len();
        let required = self.pricing.credits_per_image * pose_count as i64;

        if !self.ledger.has_sufficient(&request.user_id, required).await? {
            let available = self.ledger.get_balance(&request.user_id).await?.available;
            tracing::info!(
                user_id = %request.user_id,
                required,
                available,
                "Execution rejected: insufficient credits"
            );
            return Err(PipelineError::InsufficientCredits {
                required,
                available,
            });
        }

        let project = self.prepare_project(&request).await?;
        let chain = self.chains.resolve(request.tier);

        let mut execution = Execution::new(
            request.user_id.clone(),
            project.id,
            request.tier,
            chain.steps.clone(),
            required,
        );
        db::executions::insert_execution(&self.db, &execution).await?;

        let placeholders: Vec<GenerationResult> = request
            .poses
            .iter()
            .enumerate()
            .map(|(index, pose)| {
                GenerationResult::placeholder(
                    execution.id,
                    project.id,
                    index as i64,
                    pose,
                    &request.clothing_image_url,
                )
            })
            .collect();
        db::results::insert_results(&self.db, &placeholders).await?;

        let description = format!("Generated {} image(s)", pose_count);
        match self
            .ledger
            .charge_execution(&execution.user_id, required, &description, execution.id)
            .await
        {
            Ok(_) => execution.status = ExecutionStatus::Processing,
            // Cancelled or recovered before payment; already closed, nothing charged
            Err(e @ PipelineError::InvalidState(_)) => return Err(e),
            Err(e) => {
                self.fail_unpaid_execution(&execution, &e).await;
                return Err(e);
            }
        }

        tracing::info!(
            execution_id = %execution.id,
            project_id = %project.id,
            user_id = %execution.user_id,
            tier = %execution.tier,
            pose_count,
            credits_reserved = required,
            "Execution started"
        );

        self.event_bus.emit_lossy(TrayveEvent::ExecutionStarted {
            execution_id: execution.id,
            project_id: project.id,
            user_id: execution.user_id.clone(),
            pose_count,
            credits_reserved: required,
            timestamp: Utc::now(),
        });

        self.spawn_execution(execution.clone(), chain).await;

        Ok(execution)
    }

    /// Cancel a running execution
    ///
    /// Poses that already produced their final image are kept and charged;
    /// every other pose is marked cancelled and refunded. The background task
    /// stops at its next step boundary.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        let mut execution = self.load_execution(execution_id).await?;

        if execution.status == ExecutionStatus::Pending {
            if self
                .close_unpaid_execution(&execution, ExecutionStatus::Cancelled, None)
                .await?
            {
                tracing::info!(execution_id = %execution_id, "Execution cancelled before payment");
                return self.load_execution(execution_id).await;
            }
            // The debit committed in between; cancel it as a paid execution
            execution = self.load_execution(execution_id).await?;
        }

        if execution.status != ExecutionStatus::Processing {
            return Err(PipelineError::InvalidState(format!(
                "Execution {} is already {}",
                execution_id, execution.status
            )));
        }

        // Freeze the pose set first: afterwards no pose can still complete.
        // The task is only stopped once the freeze is durable, so a failed
        // write leaves it running to its own reconciliation.
        let cancelled = db::results::resolve_processing_results(
            &self.db,
            execution_id,
            ResultStatus::Cancelled,
            None,
        )
        .await?;

        if let Some(token) = self.cancellation_tokens.read().await.get(&execution_id) {
            token.cancel();
        }

        match self.reconcile_cancelled(&execution).await? {
            ReconcileOutcome::Applied { refunded, .. } => {
                tracing::info!(
                    execution_id = %execution_id,
                    cancelled_poses = cancelled,
                    credits_refunded = refunded,
                    "Execution cancelled"
                );
            }
            ReconcileOutcome::AlreadyFinalized => {
                return Err(PipelineError::InvalidState(format!(
                    "Execution {} finished before it could be cancelled",
                    execution_id
                )));
            }
        }

        self.load_execution(execution_id).await
    }

    /// Read-only status projection; counts are re-derived from the result rows
    pub async fn get_execution_status(
        &self,
        execution_id: Uuid,
    ) -> PipelineResult<ExecutionStatusReport> {
        let execution = self.load_execution(execution_id).await?;
        let results = db::results::load_results_for_execution(&self.db, execution_id).await?;

        let count = |status: ResultStatus| results.iter().filter(|r| r.status == status).count();

        Ok(ExecutionStatusReport {
            total_poses: results.len(),
            completed_poses: count(ResultStatus::Completed),
            failed_poses: count(ResultStatus::Failed),
            cancelled_poses: count(ResultStatus::Cancelled),
            processing_poses: count(ResultStatus::Processing),
            execution,
            results,
        })
    }

    /// Results gallery of a project
    pub async fn list_project_results(
        &self,
        project_id: Uuid,
    ) -> PipelineResult<Vec<GenerationResult>> {
        if db::projects::load_project(&self.db, project_id).await?.is_none() {
            return Err(PipelineError::NotFound(format!("Project {}", project_id)));
        }
        Ok(db::results::load_results_for_project(&self.db, project_id).await?)
    }

    /// Finish executions left open by a previous process; run before serving
    ///
    /// Unfinished poses of a paid (`processing`) execution are marked failed
    /// and refunded through the normal reconciliation. A `pending` execution
    /// was never charged and is failed without a refund. Executions with a
    /// live task in this process are skipped.
    pub async fn recover_interrupted_executions(&self) -> PipelineResult<usize> {
        let mut recovered = 0;

        let unpaid = db::executions::list_by_status(&self.db, ExecutionStatus::Pending).await?;
        for execution in unpaid {
            tracing::warn!(
                execution_id = %execution.id,
                user_id = %execution.user_id,
                "Closing execution interrupted before payment"
            );
            if self
                .close_unpaid_execution(&execution, ExecutionStatus::Failed, Some(INTERRUPTED_MESSAGE))
                .await?
            {
                recovered += 1;
            }
        }

        let stranded = db::executions::list_by_status(&self.db, ExecutionStatus::Processing).await?;

        for execution in stranded {
            if self.cancellation_tokens.read().await.contains_key(&execution.id) {
                continue;
            }

            tracing::warn!(
                execution_id = %execution.id,
                user_id = %execution.user_id,
                "Recovering interrupted execution"
            );
            if let ReconcileOutcome::Applied { .. } =
                self.abort_execution(&execution, INTERRUPTED_MESSAGE).await?
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "Interrupted executions recovered");
        }
        Ok(recovered)
    }

    fn validate_request(&self, request: &ExecutionRequest) -> PipelineResult<()> {
        if request.user_id.trim().is_empty() {
            return Err(PipelineError::Validation("user_id is required".to_string()));
        }
        if request.clothing_image_url.trim().is_empty() {
            return Err(PipelineError::Validation(
                "clothing_image_url is required".to_string(),
            ));
        }
        if request.poses.is_empty() {
            return Err(PipelineError::Validation(
                "At least one pose is required".to_string(),
            ));
        }
        if request.poses.len() > self.pricing.max_poses {
            return Err(PipelineError::Validation(format!(
                "At most {} poses per execution, got {}",
                self.pricing.max_poses,
                request.poses.len()
            )));
        }
        let mut seen = HashSet::new();
        for (index, pose) in request.poses.iter().enumerate() {
            if pose.pose_id.trim().is_empty() {
                return Err(PipelineError::Validation(format!(
                    "Pose {} has no pose_id",
                    index
                )));
            }
            if pose.model_image_url.trim().is_empty() {
                return Err(PipelineError::Validation(format!(
                    "Pose {} has no model_image_url",
                    pose.pose_id
                )));
            }
            if !seen.insert(pose.pose_id.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "Pose {} appears more than once",
                    pose.pose_id
                )));
            }
        }
        Ok(())
    }

    async fn prepare_project(&self, request: &ExecutionRequest) -> PipelineResult<Project> {
        match request.project_id {
            Some(project_id) => {
                let mut project = db::projects::load_project(&self.db, project_id)
                    .await?
                    .filter(|p| p.user_id == request.user_id)
                    .ok_or_else(|| PipelineError::NotFound(format!("Project {}", project_id)))?;
                if project.status == ProjectStatus::Archived {
                    db::projects::reactivate_project(&self.db, project_id).await?;
                    project.status = ProjectStatus::Active;
                }
                Ok(project)
            }
            None => {
                let name = request
                    .project_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("Generation {}", Utc::now().format("%Y-%m-%d %H:%M")));
                let project = Project::new(request.user_id.clone(), name);
                db::projects::insert_project(&self.db, &project).await?;
                Ok(project)
            }
        }
    }

    /// The debit failed: nothing was charged, so no refund is owed
    async fn fail_unpaid_execution(&self, execution: &Execution, error: &PipelineError) {
        tracing::error!(
            execution_id = %execution.id,
            user_id = %execution.user_id,
            error = %error,
            "Credit reservation failed, execution not started"
        );

        let message = match error {
            PipelineError::InsufficientCredits { .. } => "Insufficient credits",
            _ => "Payment could not be processed",
        };

        if let Err(e) = self
            .close_unpaid_execution(execution, ExecutionStatus::Failed, Some(message))
            .await
        {
            tracing::error!(
                execution_id = %execution.id,
                error = %e,
                "Failed to mark unpaid execution as failed"
            );
        }
    }

    /// Close a `pending` execution without touching the ledger
    ///
    /// Returns false if the execution had already left `pending`; in that
    /// case nothing changed.
    async fn close_unpaid_execution(
        &self,
        execution: &Execution,
        status: ExecutionStatus,
        message: Option<&str>,
    ) -> PipelineResult<bool> {
        if !db::executions::abandon_pending_execution(&self.db, execution.id, status, message).await? {
            return Ok(false);
        }

        let pose_status = match status {
            ExecutionStatus::Cancelled => ResultStatus::Cancelled,
            _ => ResultStatus::Failed,
        };
        db::results::resolve_processing_results(&self.db, execution.id, pose_status, message)
            .await?;
        db::projects::archive_project(&self.db, execution.project_id).await?;

        let timestamp = Utc::now();
        let event = match status {
            ExecutionStatus::Cancelled => TrayveEvent::ExecutionCancelled {
                execution_id: execution.id,
                credits_refunded: 0,
                timestamp,
            },
            _ => TrayveEvent::ExecutionFailed {
                execution_id: execution.id,
                error: message.unwrap_or(INTERRUPTED_MESSAGE).to_string(),
                timestamp,
            },
        };
        self.event_bus.emit_lossy(event);

        Ok(true)
    }

    /// Queue the background task; it waits for a worker permit before starting
    async fn spawn_execution(self: &Arc<Self>, execution: Execution, chain: StepChain) {
        let token = CancellationToken::new();
        self.cancellation_tokens
            .write()
            .await
            .insert(execution.id, token.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let execution_id = execution.id;

            let permit = tokio::select! {
                permit = Arc::clone(&orchestrator.worker_permits).acquire_owned() => permit,
                _ = token.cancelled() => {
                    tracing::info!(execution_id = %execution_id, "Execution cancelled while queued");
                    orchestrator.cancellation_tokens.write().await.remove(&execution_id);
                    return;
                }
            };
            let Ok(_permit) = permit else {
                tracing::error!(execution_id = %execution_id, "Worker pool closed");
                orchestrator.cancellation_tokens.write().await.remove(&execution_id);
                return;
            };

            tracing::debug!(execution_id = %execution_id, "Background execution task started");

            if let Err(e) = orchestrator.process_all_poses(&execution, &chain, &token).await {
                tracing::error!(
                    execution_id = %execution_id,
                    error = %e,
                    "Execution task failed, aborting"
                );
                if let Err(e) = orchestrator.abort_execution(&execution, INTERRUPTED_MESSAGE).await {
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %e,
                        "Abort failed; execution left for startup recovery"
                    );
                }
            }

            orchestrator.cancellation_tokens.write().await.remove(&execution_id);
        });
    }

    async fn load_execution(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        db::executions::load_execution(&self.db, execution_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("Execution {}", execution_id)))
    }
}
