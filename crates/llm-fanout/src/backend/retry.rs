//! Retrying retriable backend failures.

use super::{BackendError, FragmentStream, LlmBackend};
use crate::schema::SchemaDescriptor;
use crate::template::ModelParameters;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (1-based).
///
/// A server-provided `retry_after` wins; otherwise exponential backoff from
/// `base_delay` with full jitter, capped at 30 seconds.
pub fn backoff_delay(err: &BackendError, attempt: u32, base_delay: Duration) -> Duration {
    if let Some(delay) = err.retry_after {
        return delay;
    }
    let exponent = attempt.saturating_sub(1).min(16);
    let ceiling = base_delay.saturating_mul(1 << exponent).min(MAX_BACKOFF);
    let millis = ceiling.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Runs `operation` until it succeeds, fails with a non-retriable error, or
/// `max_retries` retries have been spent.
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, BackendError>> + Send,
    T: Send,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(output) => {
                if attempts > 1 {
                    info!(attempts, max = max_retries + 1, "Backend call succeeded after retry");
                }
                return Ok(output);
            }
            Err(e) if e.retriable && attempts <= max_retries => {
                let delay = backoff_delay(&e, attempts, base_delay);
                warn!(
                    attempt = attempts,
                    max = max_retries + 1,
                    error = %e,
                    ?delay,
                    "Backend call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.retriable {
                    error!(attempts, error = %e, "Backend call failed, retries exhausted");
                } else {
                    error!(error = %e, "Backend call failed with non-retriable error");
                }
                return Err(e);
            }
        }
    }
}

/// Wraps a backend so retriable failures are retried with backoff.
///
/// Only the initial request of `call_streaming` is retried; once fragments
/// flow, errors are passed through.
#[derive(Debug, Clone)]
pub struct RetryBackend<B> {
    inner: B,
    max_retries: u32,
    base_delay: Duration,
}

impl<B: LlmBackend> RetryBackend<B> {
    /// `max_retries` does not count the first attempt.
    pub fn new(inner: B, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[async_trait]
impl<B: LlmBackend> LlmBackend for RetryBackend<B> {
    async fn call(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<JsonValue, BackendError> {
        retry_with_backoff(self.max_retries, self.base_delay, || {
            self.inner.call(prompt, params, schema)
        })
        .await
    }

    async fn call_streaming(
        &self,
        prompt: &str,
        params: &ModelParameters,
        schema: &SchemaDescriptor,
    ) -> Result<FragmentStream, BackendError> {
        retry_with_backoff(self.max_retries, self.base_delay, || {
            self.inner.call_streaming(prompt, params, schema)
        })
        .await
    }

    // Transparent so logs keep naming the real backend.
    fn name(&self) -> String {
        self.inner.name()
    }
}
