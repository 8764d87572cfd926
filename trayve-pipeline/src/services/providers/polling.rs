//! Fixed-interval polling of long-running provider jobs

use std::future::Future;
use std::time::{Duration, Instant};

use super::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Hard deadline measured from the first poll
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(240),
        }
    }
}

/// State reported by one status check
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    Pending,
    Done(T),
}

/// Call `check` every `interval` until it is done, fails, or the deadline passes
///
/// On deadline a `Timeout` error is returned; upstream cancellation is the
/// caller's job since only it knows the job id.
pub async fn poll_until<F, Fut, T>(
    settings: PollSettings,
    label: &str,
    mut check: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>, ProviderError>>,
{
    let started = Instant::now();
    let mut polls = 0u32;

    loop {
        polls += 1;
        match check().await {
            Ok(PollState::Done(value)) => {
                tracing::debug!(
                    provider = label,
                    polls,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Provider job finished"
                );
                return Ok(value);
            }
            Ok(PollState::Pending) => {}
            // A flaky status endpoint does not fail the job; the deadline still applies
            Err(err) if err.is_transient() => {
                tracing::debug!(provider = label, polls, error = %err, "Status check failed");
            }
            Err(err) => return Err(err),
        }

        if started.elapsed() + settings.interval > settings.timeout {
            return Err(ProviderError::timeout(format!(
                "{} did not finish within {}s",
                label,
                settings.timeout.as_secs()
            )));
        }
        tokio::time::sleep(settings.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_returns_when_done() {
        let polls = AtomicU32::new(0);
        let value = poll_until(fast(), "job", || async {
            if polls.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(PollState::Pending)
            } else {
                Ok(PollState::Done(42))
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_times_out() {
        let err = poll_until(fast(), "job", || async { Ok(PollState::<()>::Pending) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_transient_status_errors_keep_polling() {
        let polls = AtomicU32::new(0);
        let value = poll_until(fast(), "job", || async {
            match polls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ProviderError::transient("502")),
                _ => Ok(PollState::Done("url")),
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "url");
    }

    #[tokio::test]
    async fn test_permanent_status_error_stops() {
        let err = poll_until(fast(), "job", || async {
            Err::<PollState<()>, _>(ProviderError::permanent("generation failed"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Permanent);
    }
}
