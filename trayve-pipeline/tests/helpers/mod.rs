//! Shared fixtures for trayve-pipeline integration tests
//!
//! File-backed temp databases (each in-memory SQLite connection would get its
//! own database), scripted provider adapters and an in-memory blob store.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use trayve_common::events::EventBus;
use uuid::Uuid;

use trayve_pipeline::config::PricingConfig;
use trayve_pipeline::models::{ExecutionRequest, ExecutionStatusReport, PoseInput, StepType, Tier};
use trayve_pipeline::services::{
    ArtifactSource, ArtifactStore, BlobStorage, PipelineOrchestrator, ProviderError,
    ProviderRegistry, StepAdapter, StepChainPolicy, StepRequest, StorageError,
};

/// Smallest valid PNG header; enough for content sniffing
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

pub const CREDITS_PER_IMAGE: i64 = 1000;

pub async fn test_pool() -> (TempDir, sqlx::SqlitePool) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = trayve_common::db::init_database(&dir.path().join("trayve.db"))
        .await
        .expect("Failed to init database");
    (dir, pool)
}

pub fn pricing() -> PricingConfig {
    PricingConfig {
        credits_per_image: CREDITS_PER_IMAGE,
        max_poses: 10,
        welcome_credits: 0,
    }
}

/// Blob storage that keeps everything in memory
///
/// Downloads of any URL return a PNG, so provider URLs can be fake.
#[derive(Default)]
pub struct MemoryBlobStorage {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_uploads: bool,
}

impl MemoryBlobStorage {
    pub fn failing() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fail_uploads: true,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn upload(
        &self,
        data: Vec<u8>,
        path: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        if self.fail_uploads {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "bucket unavailable",
            )));
        }
        self.objects.lock().unwrap().insert(path.to_string(), data);
        Ok(format!("memory://{}", path))
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, StorageError> {
        Ok(PNG_BYTES.to_vec())
    }
}

/// Scripted adapter for one step
///
/// Fails for the listed pose ids (or always), otherwise returns a provider
/// URL. With a gate, every call first takes one permit from it, so a test can
/// hold the background task at a known point.
pub struct FakeAdapter {
    step: StepType,
    failing_poses: HashSet<String>,
    fail_all: bool,
    gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn ok(step: StepType) -> Self {
        Self {
            step,
            failing_poses: HashSet::new(),
            fail_all: false,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(step: StepType) -> Self {
        Self {
            fail_all: true,
            ..Self::ok(step)
        }
    }

    pub fn failing_for(step: StepType, poses: &[&str]) -> Self {
        Self {
            failing_poses: poses.iter().map(|p| p.to_string()).collect(),
            ..Self::ok(step)
        }
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAdapter for FakeAdapter {
    fn step(&self) -> StepType {
        self.step
    }

    async fn execute(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        if self.fail_all || self.failing_poses.contains(&request.pose_id) {
            return Err(ProviderError::permanent("model rejected the input"));
        }
        Ok(ArtifactSource::Url(format!(
            "https://provider.test/{}/{}.png",
            request.pose_id, request.step
        )))
    }
}

/// Registry with a succeeding adapter for every step
pub fn all_ok_registry() -> ProviderRegistry {
    registry_with(vec![])
}

/// Registry where the given adapters replace the default succeeding ones
pub fn registry_with(overrides: Vec<Arc<dyn StepAdapter>>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for step in [
        StepType::TryOn,
        StepType::Watermark,
        StepType::EnhancedUpscale,
        StepType::FaceRefine,
    ] {
        registry.register(Arc::new(FakeAdapter::ok(step)));
    }
    for adapter in overrides {
        registry.register(adapter);
    }
    registry
}

pub struct TestEnv {
    pub _dir: TempDir,
    pub pool: sqlx::SqlitePool,
    pub event_bus: EventBus,
    pub storage: Arc<MemoryBlobStorage>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl TestEnv {
    pub async fn new(registry: ProviderRegistry) -> Self {
        Self::with_storage(registry, Arc::new(MemoryBlobStorage::default())).await
    }

    pub async fn with_storage(registry: ProviderRegistry, storage: Arc<MemoryBlobStorage>) -> Self {
        let (dir, pool) = test_pool().await;
        let event_bus = EventBus::new(256);
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            pool.clone(),
            event_bus.clone(),
            registry,
            ArtifactStore::new(storage.clone()),
            StepChainPolicy::default(),
            pricing(),
            4,
        ));

        Self {
            _dir: dir,
            pool,
            event_bus,
            storage,
            orchestrator,
        }
    }

    /// Create an account holding `credits`
    pub async fn fund(&self, user_id: &str, credits: i64) {
        self.orchestrator
            .ledger()
            .ensure_account(user_id, credits)
            .await
            .expect("Failed to create account");
    }

    pub async fn available(&self, user_id: &str) -> i64 {
        self.orchestrator
            .ledger()
            .get_balance(user_id)
            .await
            .expect("Failed to read balance")
            .available
    }
}

pub fn request(user_id: &str, tier: Tier, pose_count: usize) -> ExecutionRequest {
    ExecutionRequest {
        user_id: user_id.to_string(),
        project_id: None,
        project_name: Some("Summer drop".to_string()),
        tier,
        clothing_image_url: "https://cdn.test/garment.png".to_string(),
        poses: (0..pose_count)
            .map(|i| PoseInput {
                pose_id: format!("pose-{}", i),
                pose_name: format!("Pose {}", i),
                model_image_url: format!("https://cdn.test/model-{}.png", i),
            })
            .collect(),
    }
}

/// Poll until the execution reaches a terminal status and its task has exited
pub async fn wait_for_terminal(
    orchestrator: &PipelineOrchestrator,
    execution_id: Uuid,
) -> ExecutionStatusReport {
    for _ in 0..500 {
        let report = orchestrator
            .get_execution_status(execution_id)
            .await
            .expect("Failed to read status");
        if report.execution.status.is_terminal() && orchestrator.active_executions().await == 0 {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Execution {} did not finish in time", execution_id);
}

/// Poll until `count` calls have reached the adapter (gated ones included)
pub async fn wait_for_calls(adapter: &FakeAdapter, count: usize) {
    for _ in 0..500 {
        if adapter.call_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Adapter reached {} of {} calls", adapter.call_count(), count);
}
