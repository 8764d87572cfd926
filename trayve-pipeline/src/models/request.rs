//! Execution request and status projection types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Execution, GenerationResult, Tier};

/// One pose of a generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseInput {
    pub pose_id: String,
    #[serde(default)]
    pub pose_name: String,
    /// Model photo the garment is composited onto
    pub model_image_url: String,
}

/// Request to generate a batch of poses for one garment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub user_id: String,
    /// Existing project to add results to; a new project is created when absent
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// Display name for a newly created project
    #[serde(default)]
    pub project_name: Option<String>,
    pub tier: Tier,
    pub clothing_image_url: String,
    pub poses: Vec<PoseInput>,
}

/// Read-only status projection for pollers
///
/// Counts are re-derived from the result rows on every read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatusReport {
    pub execution: Execution,
    pub total_poses: usize,
    pub completed_poses: usize,
    pub failed_poses: usize,
    pub cancelled_poses: usize,
    pub processing_poses: usize,
    pub results: Vec<GenerationResult>,
}
