//! Virtual try-on job API
//!
//! `POST {base}/run` submits a composite of the model photo and the garment,
//! `GET {base}/status/{id}` reports progress, `POST {base}/cancel/{id}` aborts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::polling::{poll_until, PollSettings, PollState};
use super::{endpoint, http_client, Backend, ProviderError, ProviderErrorKind, StepRequest};
use crate::config::BackendConfig;
use crate::models::Quality;
use crate::services::artifact_store::ArtifactSource;

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    model_image: &'a str,
    garment_image: &'a str,
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    num_samples: u32,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Provider speed/quality mode for a requested quality
fn mode_for(quality: Quality) -> &'static str {
    match quality {
        Quality::Standard => "performance",
        Quality::High => "balanced",
        Quality::Premium => "quality",
    }
}

fn settle(job: JobStatus) -> Result<PollState<String>, ProviderError> {
    match job.status.as_str() {
        "completed" => job
            .output
            .into_iter()
            .next()
            .map(PollState::Done)
            .ok_or_else(|| ProviderError::permanent("Try-on completed without output")),
        "failed" | "canceled" => Err(ProviderError::permanent(format!(
            "Try-on {}: {}",
            job.status,
            job.error.unwrap_or_else(|| "no details".to_string())
        ))),
        _ => Ok(PollState::Pending),
    }
}

pub struct JobBackend {
    name: String,
    config: BackendConfig,
    poll: PollSettings,
    http_client: reqwest::Client,
}

impl JobBackend {
    pub fn new(config: &BackendConfig, poll: PollSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            name: config.name.clone(),
            config: config.clone(),
            poll,
            http_client: http_client()?,
        })
    }

    async fn status(&self, base_url: &str, api_key: &str, id: &str) -> Result<JobStatus, ProviderError> {
        let response = self
            .http_client
            .get(format!("{}/status/{}", base_url, id))
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
        if let Err(e) = self
            .http_client
            .post(format!("{}/cancel/{}", base_url, id))
            .bearer_auth(api_key)
            .send()
            .await
        {
            tracing::warn!(backend = %self.name, job_id = id, error = %e, "Try-on cancel failed");
        }
    }
}

#[async_trait]
impl Backend for JobBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
        let (base_url, api_key) = endpoint(&self.config)?;

        let body = RunRequest {
            model_image: &request.model_image_url,
            garment_image: &request.clothing_image_url,
            mode: mode_for(request.quality),
            model_name: self.config.model.as_deref(),
            num_samples: 1,
        };

        let response = self
            .http_client
            .post(format!("{}/run", base_url))
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }
        let RunResponse { id } = response.json().await?;

        tracing::debug!(
            backend = %self.name,
            execution_id = %request.execution_id,
            pose_id = %request.pose_id,
            job_id = %id,
            "Try-on job submitted"
        );

        let outcome = poll_until(self.poll, &self.name, || async {
            settle(self.status(&base_url, &api_key, &id).await?)
        })
        .await;

        match outcome {
            Ok(url) => Ok(ArtifactSource::Url(url)),
            Err(err) => {
                if err.kind == ProviderErrorKind::Timeout {
                    self.cancel(&base_url, &api_key, &id).await;
                }
                Err(err)
            }
        }
    }
}
