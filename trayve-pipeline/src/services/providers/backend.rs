//! Ordered backend fallback chain

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::{ProviderError, ProviderErrorKind, RetryPolicy, StepAdapter, StepRequest};
use crate::models::StepType;
use crate::services::artifact_store::ArtifactSource;

/// One remote API able to perform a step
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError>;
}

/// Step adapter trying its backends in order
///
/// Misconfigured, unreachable or timed-out backends fall through to the next
/// one. A permanent rejection stops the chain: the input itself was refused.
pub struct BackendChain {
    step: StepType,
    backends: Vec<Arc<dyn Backend>>,
    retry: RetryPolicy,
}

impl BackendChain {
    pub fn new(step: StepType, backends: Vec<Arc<dyn Backend>>, retry: RetryPolicy) -> Self {
        Self {
            step,
            backends,
            retry,
        }
    }
}

#[async_trait]
impl StepAdapter for BackendChain {
    fn step(&self) -> StepType {
        self.step
    }

    async fn execute(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
        let mut last_error =
            ProviderError::not_configured(format!("No backend configured for {}", self.step));

        for backend in &self.backends {
            let started = Instant::now();
            match self.retry.run(backend.name(), || backend.call(request)).await {
                Ok(artifact) => {
                    tracing::info!(
                        execution_id = %request.execution_id,
                        pose_id = %request.pose_id,
                        step = %self.step,
                        backend = backend.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Provider step succeeded"
                    );
                    return Ok(artifact);
                }
                Err(err) if err.kind == ProviderErrorKind::Permanent => {
                    tracing::warn!(
                        execution_id = %request.execution_id,
                        pose_id = %request.pose_id,
                        step = %self.step,
                        backend = backend.name(),
                        error = %err,
                        "Provider rejected request"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        execution_id = %request.execution_id,
                        step = %self.step,
                        backend = backend.name(),
                        error = %err,
                        "Provider backend unavailable, trying next"
                    );
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Quality;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct Scripted {
        name: &'static str,
        responses: Mutex<Vec<Result<ArtifactSource, ProviderError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, responses: Vec<Result<ArtifactSource, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, _request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(ProviderError::permanent("script exhausted"))
            } else {
                responses.remove(0)
            }
        }
    }

    fn request() -> StepRequest {
        StepRequest {
            execution_id: Uuid::new_v4(),
            user_id: "u".to_string(),
            pose_id: "front".to_string(),
            step: StepType::TryOn,
            image_url: "https://img/garment.png".to_string(),
            model_image_url: "https://img/model.png".to_string(),
            clothing_image_url: "https://img/garment.png".to_string(),
            quality: Quality::High,
            upscale_factor: 2,
        }
    }

    fn url(u: &str) -> ArtifactSource {
        ArtifactSource::Url(u.to_string())
    }

    fn chain(backends: Vec<Arc<Scripted>>) -> BackendChain {
        BackendChain::new(
            StepType::TryOn,
            backends
                .into_iter()
                .map(|b| b as Arc<dyn Backend>)
                .collect(),
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let primary = Scripted::new("primary", vec![Ok(url("https://a/1.png"))]);
        let secondary = Scripted::new("secondary", vec![Ok(url("https://b/1.png"))]);
        let adapter = chain(vec![primary.clone(), secondary.clone()]);

        assert_eq!(adapter.execute(&request()).await.unwrap(), url("https://a/1.png"));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_primary_falls_through() {
        let primary = Scripted::new("primary", vec![Err(ProviderError::not_configured("no key"))]);
        let secondary = Scripted::new("secondary", vec![Ok(url("https://b/1.png"))]);
        let adapter = chain(vec![primary.clone(), secondary]);

        assert_eq!(adapter.execute(&request()).await.unwrap(), url("https://b/1.png"));
        // NotConfigured is not retried
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_transient_retries_fall_through() {
        let primary = Scripted::new(
            "primary",
            vec![
                Err(ProviderError::transient("503")),
                Err(ProviderError::transient("503")),
            ],
        );
        let secondary = Scripted::new("secondary", vec![Ok(url("https://b/1.png"))]);
        let adapter = chain(vec![primary.clone(), secondary]);

        assert!(adapter.execute(&request()).await.is_ok());
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_chain() {
        let primary = Scripted::new("primary", vec![Err(ProviderError::permanent("nsfw"))]);
        let secondary = Scripted::new("secondary", vec![Ok(url("https://b/1.png"))]);
        let adapter = chain(vec![primary, secondary.clone()]);

        let err = adapter.execute(&request()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Permanent);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_is_not_configured() {
        let err = chain(Vec::new()).execute(&request()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::NotConfigured);
    }
}
