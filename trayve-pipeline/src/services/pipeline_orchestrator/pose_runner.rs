//! Per-pose step chain execution

use chrono::Utc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use trayve_common::events::TrayveEvent;

use super::PipelineOrchestrator;
use crate::db;
use crate::error::PipelineResult;
use crate::models::execution::compute_progress;
use crate::models::generation_result::POSE_FAILED_MESSAGE;
use crate::models::{Execution, GenerationResult, ResultStatus, StepOutcome, StepType};
use crate::services::artifact_store::{ArtifactKey, ArtifactSource};
use crate::services::providers::{ProviderError, StepRequest};
use crate::services::step_chain::StepChain;

/// How one pose ended from the background task's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoseOutcome {
    Completed,
    Failed,
    /// Cancelled (or resolved by another writer) before the task finished it
    Interrupted,
}

impl PipelineOrchestrator {
    /// Background body: run every pose in order, then reconcile
    pub(super) async fn process_all_poses(
        &self,
        execution: &Execution,
        chain: &StepChain,
        token: &CancellationToken,
    ) -> PipelineResult<()> {
        let results = db::results::load_results_for_execution(&self.db, execution.id).await?;
        let total = results.len();

        for result in results {
            if token.is_cancelled() {
                break;
            }
            if result.status != ResultStatus::Processing {
                continue;
            }

            let outcome = self.run_pose(execution, chain, result, token).await?;
            if outcome == PoseOutcome::Interrupted {
                continue;
            }

            let counts = db::results::count_by_status(&self.db, execution.id).await?;
            let progress = compute_progress(counts.resolved(), total);
            db::executions::update_progress(&self.db, execution.id, progress).await?;

            self.event_bus.emit_lossy(TrayveEvent::ExecutionProgress {
                execution_id: execution.id,
                progress,
                completed_poses: counts.completed,
                failed_poses: counts.failed,
                total_poses: total,
                timestamp: Utc::now(),
            });
        }

        if token.is_cancelled() {
            tracing::info!(execution_id = %execution.id, "Background task stopped after cancellation");
            return Ok(());
        }

        self.reconcile_completed(execution).await?;
        Ok(())
    }

    /// Run the step chain for one pose
    ///
    /// Try-on failure fails the pose. Later step failures are recorded and the
    /// last good artifact is kept. The result row is saved after every step.
    async fn run_pose(
        &self,
        execution: &Execution,
        chain: &StepChain,
        mut result: GenerationResult,
        token: &CancellationToken,
    ) -> PipelineResult<PoseOutcome> {
        let mut current_image = result.clothing_image_url.clone();

        for &step in &chain.steps {
            if token.is_cancelled() {
                return Ok(PoseOutcome::Interrupted);
            }

            let request = StepRequest {
                execution_id: execution.id,
                user_id: execution.user_id.clone(),
                pose_id: result.pose_id.clone(),
                step,
                image_url: current_image.clone(),
                model_image_url: result.model_image_url.clone(),
                clothing_image_url: result.clothing_image_url.clone(),
                quality: chain.quality,
                upscale_factor: chain.upscale_factor(),
            };

            let started = Instant::now();
            let outcome = match self.call_provider(&request).await {
                Ok(source) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    match self.store_artifact(execution, &result, step, &source).await {
                        Some(url) => {
                            current_image = url.clone();
                            StepOutcome::completed(
                                step,
                                url,
                                source.provider_url().map(str::to_string),
                                elapsed_ms,
                            )
                        }
                        None => StepOutcome::failed(
                            step,
                            "Artifact could not be stored".to_string(),
                            elapsed_ms,
                        ),
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        pose_id = %result.pose_id,
                        step = %step,
                        error = %err,
                        "Step failed"
                    );
                    StepOutcome::failed(
                        step,
                        err.public_message().to_string(),
                        started.elapsed().as_millis() as u64,
                    )
                }
            };

            let step_failed = outcome.artifact_url.is_none();
            result.record_step(outcome);

            if step_failed && step.is_fatal() {
                return self.fail_pose(execution, result).await;
            }

            if !db::results::save_step_progress(&self.db, &result).await? {
                return Ok(PoseOutcome::Interrupted);
            }
        }

        // A chain always starts with try-on, so a surviving pose has an image
        let Some(final_image_url) = result.final_image_url.clone() else {
            return self.fail_pose(execution, result).await;
        };

        if !db::results::resolve_result(&self.db, &result, ResultStatus::Completed).await? {
            return Ok(PoseOutcome::Interrupted);
        }

        tracing::info!(
            execution_id = %execution.id,
            pose_id = %result.pose_id,
            "Pose completed"
        );
        self.event_bus.emit_lossy(TrayveEvent::PoseCompleted {
            execution_id: execution.id,
            result_id: result.id,
            pose_id: result.pose_id.clone(),
            final_image_url,
            timestamp: Utc::now(),
        });

        Ok(PoseOutcome::Completed)
    }

    async fn call_provider(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
        match self.providers.get(request.step) {
            Some(adapter) => adapter.execute(request).await,
            None => Err(ProviderError::not_configured(format!(
                "No adapter registered for {}",
                request.step
            ))),
        }
    }

    /// Durable URL, the provider URL when storing failed, or `None` when the
    /// artifact only existed as bytes and could not be stored
    async fn store_artifact(
        &self,
        execution: &Execution,
        result: &GenerationResult,
        step: StepType,
        source: &ArtifactSource,
    ) -> Option<String> {
        let key = ArtifactKey {
            user_id: &execution.user_id,
            execution_id: execution.id,
            pose_index: result.pose_index,
            pose_id: &result.pose_id,
            step,
        };

        match self.artifacts.persist(source, key).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(
                    execution_id = %execution.id,
                    pose_id = %result.pose_id,
                    step = %step,
                    error = %e,
                    "Artifact persist failed, using provider URL"
                );
                source.provider_url().map(str::to_string)
            }
        }
    }

    async fn fail_pose(
        &self,
        execution: &Execution,
        mut result: GenerationResult,
    ) -> PipelineResult<PoseOutcome> {
        result.error = Some(POSE_FAILED_MESSAGE.to_string());
        result.final_image_url = None;

        if !db::results::resolve_result(&self.db, &result, ResultStatus::Failed).await? {
            return Ok(PoseOutcome::Interrupted);
        }

        tracing::warn!(
            execution_id = %execution.id,
            pose_id = %result.pose_id,
            "Pose failed"
        );
        self.event_bus.emit_lossy(TrayveEvent::PoseFailed {
            execution_id: execution.id,
            result_id: result.id,
            pose_id: result.pose_id.clone(),
            error: POSE_FAILED_MESSAGE.to_string(),
            timestamp: Utc::now(),
        });

        Ok(PoseOutcome::Failed)
    }
}
