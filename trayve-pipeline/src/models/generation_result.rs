//! Per-pose generation results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::StepType;

/// Message stored on a failed pose; provider errors never reach the merchant
pub const POSE_FAILED_MESSAGE: &str = "Generation failed. No credits were charged for this pose.";

/// Pose lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Processing => "processing",
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
            ResultStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Processing)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ResultStatus::Processing),
            "completed" => Ok(ResultStatus::Completed),
            "failed" => Ok(ResultStatus::Failed),
            "cancelled" => Ok(ResultStatus::Cancelled),
            other => Err(format!("Unknown result status: {}", other)),
        }
    }
}

/// Outcome of one pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Transient per-step record, folded into `GenerationResult::step_results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_type: StepType,
    pub status: StepStatus,
    /// Durable URL (or the provider URL when persisting failed)
    pub artifact_url: Option<String>,
    /// URL returned by the provider, possibly ephemeral
    pub provider_url: Option<String>,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn completed(
        step_type: StepType,
        artifact_url: String,
        provider_url: Option<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            step_type,
            status: StepStatus::Completed,
            artifact_url: Some(artifact_url),
            provider_url,
            processing_time_ms,
            error: None,
        }
    }

    pub fn failed(step_type: StepType, error: String, processing_time_ms: u64) -> Self {
        Self {
            step_type,
            status: StepStatus::Failed,
            artifact_url: None,
            provider_url: None,
            processing_time_ms,
            error: Some(error),
        }
    }
}

/// One pose within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub project_id: Uuid,
    /// Position of the pose within the batch (processing order)
    pub pose_index: i64,
    pub pose_id: String,
    pub pose_name: String,
    pub model_image_url: String,
    pub clothing_image_url: String,
    pub status: ResultStatus,
    pub final_image_url: Option<String>,
    /// Step name → outcome, keyed by `StepType::as_str`
    pub step_results: BTreeMap<String, StepOutcome>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationResult {
    /// Placeholder row created before any provider work starts
    pub fn placeholder(
        execution_id: Uuid,
        project_id: Uuid,
        pose_index: i64,
        pose: &crate::models::PoseInput,
        clothing_image_url: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            execution_id,
            project_id,
            pose_index,
            pose_id: pose.pose_id.clone(),
            pose_name: pose.pose_name.clone(),
            model_image_url: pose.model_image_url.clone(),
            clothing_image_url: clothing_image_url.to_string(),
            status: ResultStatus::Processing,
            final_image_url: None,
            step_results: BTreeMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a step outcome, advancing `final_image_url` on success
    pub fn record_step(&mut self, outcome: StepOutcome) {
        if outcome.status == StepStatus::Completed {
            if let Some(url) = &outcome.artifact_url {
                self.final_image_url = Some(url.clone());
            }
        }
        self.step_results
            .insert(outcome.step_type.as_str().to_string(), outcome);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PoseInput;

    fn pose() -> PoseInput {
        PoseInput {
            pose_id: "pose-1".to_string(),
            pose_name: "Front".to_string(),
            model_image_url: "https://cdn.example/model.png".to_string(),
        }
    }

    #[test]
    fn test_placeholder_has_no_artifacts() {
        let result = GenerationResult::placeholder(
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
            &pose(),
            "https://cdn.example/shirt.png",
        );
        assert_eq!(result.status, ResultStatus::Processing);
        assert!(result.final_image_url.is_none());
        assert!(result.step_results.is_empty());
    }

    #[test]
    fn test_failed_step_keeps_previous_final_image() {
        let mut result = GenerationResult::placeholder(
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
            &pose(),
            "https://cdn.example/shirt.png",
        );

        result.record_step(StepOutcome::completed(
            StepType::TryOn,
            "https://store/try-on.png".to_string(),
            Some("https://provider/tmp.png".to_string()),
            1200,
        ));
        result.record_step(StepOutcome::failed(
            StepType::Watermark,
            "watermark service unavailable".to_string(),
            30,
        ));

        assert_eq!(result.final_image_url.as_deref(), Some("https://store/try-on.png"));
        assert_eq!(result.step_results["watermark"].status, StepStatus::Failed);
        assert_eq!(result.step_results["try-on"].status, StepStatus::Completed);
    }
}
