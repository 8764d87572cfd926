//! Blob storage backends for generated artifacts

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Download(String),
}

/// Durable object storage
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `data` under `path`, returning its public URL
    async fn upload(
        &self,
        data: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Fetch the bytes behind a URL (own artifacts or remote provider output)
    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError>;
}

/// Filesystem store under `<root>/artifacts`, served read-only at `/artifacts`
pub struct LocalBlobStorage {
    base_dir: PathBuf,
    public_base_url: String,
    http_client: reqwest::Client,
}

impl LocalBlobStorage {
    pub fn new(base_dir: PathBuf, public_base_url: &str) -> Result<Self, StorageError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StorageError::Download(e.to_string()))?;

        Ok(Self {
            base_dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }

    /// Map one of our own public URLs back to a relative path
    fn local_path_for_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.public_base_url.as_str())
            .map(|rest| rest.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn upload(
        &self,
        data: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;

        tracing::debug!(path, content_type, bytes = data.len(), "Artifact stored");
        Ok(format!("{}/{}", self.public_base_url, path))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(relative) = self.local_path_for_url(url) {
            let path = self.resolve(relative)?;
            return Ok(tokio::fs::read(path).await?);
        }

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Download(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::Download(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_then_download_local() {
        let dir = TempDir::new().unwrap();
        let storage =
            LocalBlobStorage::new(dir.path().to_path_buf(), "http://localhost:5740/artifacts/")
                .unwrap();

        let url = storage
            .upload(b"png-bytes".to_vec(), "u1/e1/p1/try-on.png", "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:5740/artifacts/u1/e1/p1/try-on.png");
        assert!(dir.path().join("u1/e1/p1/try-on.png").exists());

        let bytes = storage.download(&url).await.unwrap();
        assert_eq!(bytes, b"png-bytes");
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let storage = LocalBlobStorage::new(dir.path().to_path_buf(), "http://x/artifacts").unwrap();

        for bad in ["../secret", "/etc/passwd", "", "a/../../b"] {
            let err = storage.upload(vec![1], bad, "image/png").await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidPath(_)), "{}", bad);
        }
    }
}
