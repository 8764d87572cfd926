//! Execution state machine
//!
//! pending → processing → {completed | failed | cancelled}
//!
//! Terminal states are final. Every persisted transition is a conditional
//! update on the current status, so a lost race is visible to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{StepType, Tier};

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (ExecutionStatus::Pending, ExecutionStatus::Processing) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Failed) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Cancelled) => true,
            (ExecutionStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "processing" => Ok(ExecutionStatus::Processing),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("Unknown execution status: {}", other)),
        }
    }
}

/// One generation request: a batch of poses run through one step chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub user_id: String,
    pub project_id: Uuid,
    pub tier: Tier,
    pub status: ExecutionStatus,
    /// Step chain resolved once at start
    pub enabled_steps: Vec<StepType>,
    /// Percentage of poses resolved (0-100)
    pub progress: i64,
    pub credits_reserved: i64,
    pub credits_used: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Execution {
    /// New unpaid execution; it becomes `processing` when its debit commits
    pub fn new(
        user_id: String,
        project_id: Uuid,
        tier: Tier,
        enabled_steps: Vec<StepType>,
        credits_reserved: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            project_id,
            tier,
            status: ExecutionStatus::Pending,
            enabled_steps,
            progress: 0,
            credits_reserved,
            credits_used: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Progress percentage from resolved (completed + failed) poses
pub fn compute_progress(resolved: usize, total: usize) -> i64 {
    if total == 0 {
        return 0;
    }
    let resolved = resolved.min(total);
    ((resolved * 100) / total) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Processing,
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_processing_may_reach_any_terminal() {
        assert!(ExecutionStatus::Processing.can_transition_to(ExecutionStatus::Completed));
        assert!(ExecutionStatus::Processing.can_transition_to(ExecutionStatus::Failed));
        assert!(ExecutionStatus::Processing.can_transition_to(ExecutionStatus::Cancelled));
        assert!(!ExecutionStatus::Processing.can_transition_to(ExecutionStatus::Pending));
    }

    #[test]
    fn test_compute_progress() {
        assert_eq!(compute_progress(0, 3), 0);
        assert_eq!(compute_progress(1, 3), 33);
        assert_eq!(compute_progress(2, 3), 66);
        assert_eq!(compute_progress(3, 3), 100);
        assert_eq!(compute_progress(5, 3), 100);
        assert_eq!(compute_progress(0, 0), 0);
    }

    #[test]
    fn test_new_execution_starts_pending() {
        let execution = Execution::new(
            "shop-1".to_string(),
            Uuid::new_v4(),
            Tier::Free,
            vec![StepType::TryOn, StepType::Watermark],
            2000,
        );
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.progress, 0);
        assert_eq!(execution.credits_used, 0);
        assert!(execution.completed_at.is_none());
    }
}
