//! Provider adapters
//!
//! One [`StepAdapter`] per pipeline step. Each adapter is a [`BackendChain`]:
//! an ordered list of remote backends tried first-success-wins, every call
//! wrapped in a bounded retry for transient failures. The orchestrator only
//! sees an artifact or a single terminal [`ProviderError`].

pub mod backend;
pub mod compose;
pub mod polling;
pub mod prediction;
pub mod retry;
pub mod watermark;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{BackendApi, BackendConfig, CapabilityConfig, ProvidersConfig};
use crate::models::{Quality, StepType};
use crate::services::artifact_store::ArtifactSource;

pub use backend::{Backend, BackendChain};
pub use polling::PollSettings;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network hiccup, 5xx, 429; worth retrying
    Transient,
    /// Rejected input or failed generation; retrying will not help
    Permanent,
    /// Polling deadline passed
    Timeout,
    /// Missing URL or API key
    NotConfigured,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Permanent => "permanent",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::NotConfigured => "not configured",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotConfigured, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    /// Merchant-safe summary stored in `step_results`; details go to the log
    pub fn public_message(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::Transient => "Provider unavailable",
            ProviderErrorKind::Permanent => "Provider could not process the image",
            ProviderErrorKind::Timeout => "Provider timed out",
            ProviderErrorKind::NotConfigured => "Provider not configured",
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            Self::transient(message)
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Self::not_configured(message)
        } else {
            Self::permanent(message)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::permanent(format!("Malformed response: {}", err))
        } else {
            // Connect failures, request timeouts and dropped bodies
            ProviderError::transient(err.to_string())
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Input of one step call
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: Uuid,
    pub user_id: String,
    pub pose_id: String,
    pub step: StepType,
    /// Output of the previous step (the garment image for try-on)
    pub image_url: String,
    /// Model photo; try-on base and face-refine reference
    pub model_image_url: String,
    pub clothing_image_url: String,
    pub quality: Quality,
    pub upscale_factor: u32,
}

/// One pipeline capability
#[async_trait]
pub trait StepAdapter: Send + Sync {
    fn step(&self) -> StepType;

    async fn execute(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError>;
}

/// Adapters keyed by the step they implement
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<StepType, Arc<dyn StepAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same step
    pub fn register(&mut self, adapter: Arc<dyn StepAdapter>) {
        self.adapters.insert(adapter.step(), adapter);
    }

    pub fn get(&self, step: StepType) -> Option<Arc<dyn StepAdapter>> {
        self.adapters.get(&step).cloned()
    }

    /// Build HTTP adapters for every capability from configuration
    ///
    /// Capabilities without backends still get an adapter; it fails every
    /// call with `NotConfigured`, which the step policy then handles.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        for (step, capability) in [
            (StepType::TryOn, &config.compose),
            (StepType::EnhancedUpscale, &config.upscale),
            (StepType::FaceRefine, &config.enhance),
            (StepType::Watermark, &config.watermark),
        ] {
            registry.register(Arc::new(build_chain(step, capability)?));
        }
        Ok(registry)
    }
}

fn build_chain(step: StepType, capability: &CapabilityConfig) -> Result<BackendChain, ProviderError> {
    let poll = PollSettings {
        interval: Duration::from_millis(capability.poll_interval_ms),
        timeout: Duration::from_secs(capability.timeout_secs),
    };

    let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(capability.backends.len());
    for backend in &capability.backends {
        backends.push(build_backend(step, backend, poll)?);
    }

    if backends.is_empty() {
        tracing::warn!(step = %step, "No provider backends configured");
    }

    Ok(BackendChain::new(
        step,
        backends,
        RetryPolicy::new(
            capability.max_attempts,
            Duration::from_millis(capability.backoff_ms),
        ),
    ))
}

fn build_backend(
    step: StepType,
    config: &BackendConfig,
    poll: PollSettings,
) -> Result<Arc<dyn Backend>, ProviderError> {
    let api = config.api.unwrap_or(match step {
        StepType::TryOn => BackendApi::Job,
        StepType::Watermark => BackendApi::Render,
        StepType::EnhancedUpscale | StepType::FaceRefine => BackendApi::Prediction,
    });

    Ok(match api {
        BackendApi::Prediction => Arc::new(prediction::PredictionBackend::new(config, poll)?),
        BackendApi::Job => Arc::new(compose::JobBackend::new(config, poll)?),
        BackendApi::Render => Arc::new(watermark::RenderBackend::new(config)?),
    })
}

/// Shared HTTP client settings for provider calls
pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .user_agent(concat!("trayve-pipeline/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| ProviderError::not_configured(format!("HTTP client: {}", e)))
}

/// Base URL and API key of a backend, or `NotConfigured`
pub(crate) fn endpoint(config: &BackendConfig) -> Result<(String, String), ProviderError> {
    let base_url = config
        .base_url
        .as_deref()
        .map(|u| u.trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            ProviderError::not_configured(format!("Backend '{}' has no base_url", config.name))
        })?;
    let api_key = config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            ProviderError::not_configured(format!("Backend '{}' has no api_key", config.name))
        })?;
    Ok((base_url, api_key))
}
