//! Timeout, retry and cancellation around backend calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

/// Timeout and retry budget applied to each embedding or generation call.
///
/// Only errors for which [`RagError::is_retryable`] holds are retried; the
/// delay before attempt `n` is `backoff * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Number of retries after the first attempt.
    pub max_retries: usize,
    /// Base delay between attempts.
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

impl CallPolicy {
    /// Derive the policy from pipeline configuration.
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(RagError::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                }),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "retryable backend error"
                    );
                    tokio::time::sleep(self.backoff * attempt as u32).await;
                }
                other => return other,
            }
        }
    }
}

/// Race `future` against `cancel`, returning [`RagError::Cancelled`] if the
/// token fires first. The losing future is dropped.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RagError::Cancelled),
        result = future => result,
    }
}

/// An [`EmbeddingProvider`] decorator that applies a [`CallPolicy`] to every call.
pub struct GuardedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    policy: CallPolicy,
}

impl GuardedEmbedder {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: Arc<dyn EmbeddingProvider>, policy: CallPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl EmbeddingProvider for GuardedEmbedder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.policy.run("embed", || self.inner.embed(text)).await
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.policy.run("embed_batch", || self.inner.embed_batch(texts)).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn policy(max_retries: usize) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    fn unavailable() -> RagError {
        RagError::BackendUnavailable { backend: "test".into(), message: "refused".into() }
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let attempts = AtomicUsize::new(0);
        let result = policy(2)
            .run("embed", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 { Err(unavailable()) } else { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = policy(1)
            .run("embed", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;
        assert!(matches!(result, Err(RagError::BackendUnavailable { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = policy(3)
            .run("generate", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RagError::GenerationFailure { provider: "test".into(), message: "bad".into() })
            })
            .await;
        assert!(matches!(result, Err(RagError::GenerationFailure { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<()> = policy(0)
            .run("generate", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RagError::Timeout { ref operation, .. }) if operation == "generate"));
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(RagError::Cancelled)));
    }
}
