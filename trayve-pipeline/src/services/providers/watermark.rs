//! Watermark rendering service
//!
//! Synchronous `POST {base}/watermark` taking the image URL and the account
//! label and answering with the watermarked image bytes.

use async_trait::async_trait;
use serde::Serialize;

use super::{endpoint, http_client, Backend, ProviderError, StepRequest};
use crate::config::BackendConfig;
use crate::services::artifact_store::ArtifactSource;

#[derive(Debug, Serialize)]
struct WatermarkRequest<'a> {
    image_url: &'a str,
    text: String,
    position: &'static str,
    opacity: f32,
}

pub struct RenderBackend {
    name: String,
    config: BackendConfig,
    http_client: reqwest::Client,
}

impl RenderBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            name: config.name.clone(),
            config: config.clone(),
            http_client: http_client()?,
        })
    }
}

#[async_trait]
impl Backend for RenderBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &StepRequest) -> Result<ArtifactSource, ProviderError> {
        let (base_url, api_key) = endpoint(&self.config)?;

        let body = WatermarkRequest {
            image_url: &request.image_url,
            text: format!("trayve · {}", request.user_id),
            position: "bottom-right",
            opacity: 0.6,
        };

        let response = self
            .http_client
            .post(format!("{}/watermark", base_url))
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response.bytes().await?.to_vec();

        if data.is_empty() {
            return Err(ProviderError::permanent("Watermark service returned no data"));
        }

        Ok(ArtifactSource::Bytes { data, content_type })
    }
}
