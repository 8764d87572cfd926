//! Durable artifact persistence
//!
//! Provider outputs are short-lived URLs or raw bytes. Each step's output is
//! copied into blob storage under `{user}/{execution}/{index}-{pose}/{step}.{ext}` so
//! the next step and the merchant's gallery never depend on provider retention.

use std::sync::Arc;
use uuid::Uuid;

use super::blob_storage::{BlobStorage, StorageError};
use crate::models::StepType;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
const FALLBACK_EXTENSION: &str = "bin";

/// Output of a provider call
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactSource {
    /// Remote URL (usually expiring)
    Url(String),
    /// Raw bytes, e.g. a locally rendered watermark
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
}

impl ArtifactSource {
    /// URL to fall back to when persisting fails
    pub fn provider_url(&self) -> Option<&str> {
        match self {
            ArtifactSource::Url(url) => Some(url),
            ArtifactSource::Bytes { .. } => None,
        }
    }
}

/// Where one step's artifact is stored
#[derive(Debug, Clone, Copy)]
pub struct ArtifactKey<'a> {
    pub user_id: &'a str,
    pub execution_id: Uuid,
    /// Position of the pose in its execution; keeps paths unique even when
    /// sanitized pose ids collide
    pub pose_index: i64,
    pub pose_id: &'a str,
    pub step: StepType,
}

impl ArtifactKey<'_> {
    pub fn logical_path(&self, extension: &str) -> String {
        format!(
            "{}/{}/{}-{}/{}.{}",
            sanitize_segment(self.user_id),
            self.execution_id,
            self.pose_index,
            sanitize_segment(self.pose_id),
            self.step.as_str(),
            extension
        )
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    storage: Arc<dyn BlobStorage>,
}

impl ArtifactStore {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self { storage }
    }

    /// Copy an artifact into durable storage and return its public URL
    pub async fn persist(
        &self,
        source: &ArtifactSource,
        key: ArtifactKey<'_>,
    ) -> Result<String, StorageError> {
        let (data, declared_type) = match source {
            ArtifactSource::Url(url) => (self.storage.download(url).await?, None),
            ArtifactSource::Bytes { data, content_type } => {
                (data.clone(), content_type.as_deref())
            }
        };

        let (content_type, extension) = detect_type(&data, declared_type);
        let path = key.logical_path(extension);

        let url = self.storage.upload(data, &path, &content_type).await?;
        tracing::debug!(
            execution_id = %key.execution_id,
            pose_id = key.pose_id,
            step = %key.step,
            url = %url,
            "Artifact persisted"
        );
        Ok(url)
    }
}

/// Sniff the content type from magic bytes, trusting the declared type only
/// when sniffing fails
fn detect_type(data: &[u8], declared: Option<&str>) -> (String, &'static str) {
    if let Some(kind) = infer::get(data) {
        return (kind.mime_type().to_string(), kind.extension());
    }

    match declared {
        Some("image/png") => ("image/png".to_string(), "png"),
        Some("image/jpeg") => ("image/jpeg".to_string(), "jpg"),
        Some("image/webp") => ("image/webp".to_string(), "webp"),
        Some(other) => (other.to_string(), FALLBACK_EXTENSION),
        None => (FALLBACK_CONTENT_TYPE.to_string(), FALLBACK_EXTENSION),
    }
}

/// Keep user-supplied ids from introducing path separators
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}
