//! Data models for the generation pipeline

pub mod credit;
pub mod execution;
pub mod generation_result;
pub mod project;
pub mod request;
pub mod tier;

pub use credit::{CreditBalance, CreditTransaction, TransactionKind};
pub use execution::{Execution, ExecutionStatus};
pub use generation_result::{GenerationResult, ResultStatus, StepOutcome, StepStatus};
pub use project::{Project, ProjectStatus};
pub use request::{ExecutionRequest, ExecutionStatusReport, PoseInput};
pub use tier::{Quality, StepType, Tier};
