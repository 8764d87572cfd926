//! Prediction-style model hosting API
//!
//! `POST {base}/predictions` starts a job, `GET {base}/predictions/{id}` is
//! polled until `succeeded`/`failed`/`canceled`, and
//! `POST {base}/predictions/{id}/cancel` stops a job that ran past the
//! deadline. Used by upscale and face refinement, and as a try-on fallback.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::polling::{poll_until, PollSettings, PollState};
use super::{endpoint, http_client, Backend, ProviderError, StepRequest};
use crate::config::BackendConfig;
use crate::models::StepType;
use crate::services::artifact_store::ArtifactSource;

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Prediction {
    /// First output URL; models return either a string or a list of strings
    pub fn output_url(&self) -> Option<String> {
        match self.output.as_ref()? {
            Value::String(url) => Some(url.clone()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
            _ => None,
        }
    }
}

/// Model input for a step
pub fn prediction_input(request: &StepRequest) -> Value {
    match request.step {
        StepType::TryOn => json!({
            "model_image": request.model_image_url,
            "garment_image": request.clothing_image_url,
            "quality": request.quality.as_str(),
        }),
        StepType::EnhancedUpscale => json!({
            "image": request.image_url,
            "scale": request.upscale_factor,
            "face_enhance": false,
        }),
        StepType::FaceRefine => json!({
            "target_image": request.image_url,
            "reference_image": request.model_image_url,
        }),
        StepType::Watermark => json!({
            "image": request.image_url,
            "text": "trayve",
        }),
    }
}

pub struct PredictionBackend {
    name: String,
    config: BackendConfig,
    poll: PollSettings,
    http_client: reqwest::Client,
}

impl PredictionBackend {
    pub fn new(config: &BackendConfig, poll: PollSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            name: config.name.clone(),
            config: config.clone(),
            poll,
            http_client: http_client()?,
        })
    }

    async fn create(&self, base_url: &str, api_key: &str, input: Value) -> Result<Prediction, ProviderError> {
        let mut body = json!({ "input": input });
        if let Some(model) = &self.config.model {
            body["version"] = Value::String(model.clone());
        }

        let response = self
            .http_client
            .post(format!("{}/predictions", base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }
        Ok(response.json().await?)
    }

    async fn fetch(&self, base_url: &str, api_key: &str, id: &str) -> Result<Prediction, ProviderError> {
        let response = self
            .http_client
            .get(format!("{}/predictions/{}", base_url, id))
            .bearer_auth(api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }
        Ok(response.json().await?)
    }

    async fn cancel(&self, base_url: &str, api_key: &str, id: &str) {
        let result = self
            .http_client
            .post(format!("{}/predictions/{}/cancel", base_url, id))
            .bearer_auth(api_key)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(backend = %self.name, prediction_id = id, "Cancelled timed-out prediction");
            }
            Ok(response) => {
                tracing::warn!(
                    backend = %self.name,
                    prediction_id = id,
                    status = response.status().as_u16(),
                    "Prediction cancel rejected"
                );
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, prediction_id = id, error = %e, "Prediction cancel failed");
            }
        }
    }
}

fn settle(prediction: Prediction) -> Result<PollState<String>, ProviderError> {
    match prediction.status.as_str() {
        "succeeded" => prediction
            .output_url()
            .map(PollState::Done)
            .ok_or_else(|| ProviderError::permanent("Prediction succeeded without output")),
        "failed" | "canceled" => Err(ProviderError::permanent(format!(
            "Prediction {}: {}",
            prediction.status,
            prediction
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no details".to_string())
        ))),
        _ => Ok(PollState::Pending),
    }
}

#[async_trait]
impl Backend for PredictionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
        let (base_url, api_key) = endpoint(&self.config)?;

        let created = self
            .create(&base_url, &api_key, prediction_input(request))
            .await?;
        tracing::debug!(
            backend = %self.name,
            step = %request.step,
            prediction_id = %created.id,
            "Prediction created"
        );

        // Fast models may finish in the create call
        if let PollState::Done(url) = settle(created.clone())? {
            return Ok(ArtifactSource::Url(url));
        }

        let id = created.id;
        let outcome = poll_until(self.poll, &self.name, || async {
            settle(self.fetch(&base_url, &api_key, &id).await?)
        })
        .await;

        match outcome {
            Ok(url) => Ok(ArtifactSource::Url(url)),
            Err(err) => {
                if err.kind == super::ProviderErrorKind::Timeout {
                    self.cancel(&base_url, &api_key, &id).await;
                }
                Err(err)
            }
        }
    }
}
