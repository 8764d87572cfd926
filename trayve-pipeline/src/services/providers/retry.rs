//! Bounded fixed-backoff retry for transient provider errors

use std::future::Future;
use std::time::Duration;

use super::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `operation`, retrying transient failures up to `max_attempts`
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    tracing::debug!(
                        provider = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
