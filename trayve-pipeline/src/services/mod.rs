//! Business services
//!
//! The orchestrator drives executions; the other services are its
//! collaborators (ledger, step policy, provider adapters, artifact storage).

pub mod artifact_store;
pub mod blob_storage;
pub mod credit_ledger;
pub mod pipeline_orchestrator;
pub mod providers;
pub mod step_chain;

pub use artifact_store::{ArtifactKey, ArtifactSource, ArtifactStore};
pub use blob_storage::{BlobStorage, LocalBlobStorage, StorageError};
pub use credit_ledger::CreditLedger;
pub use pipeline_orchestrator::{PipelineOrchestrator, ReconcileOutcome};
pub use providers::{ProviderError, ProviderErrorKind, ProviderRegistry, StepAdapter, StepRequest};
pub use step_chain::{StepChain, StepChainPolicy};
