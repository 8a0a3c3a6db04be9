//! Retry policy with exponential backoff and jitter.
//!
//! Only errors classified retryable by [`ChatError::kind`] are retried;
//! permanent errors are surfaced to the caller immediately.

use crate::error::ChatError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Execute an operation, retrying transient failures with bounded backoff.
///
/// Returns the last error once retries are exhausted, or the first
/// permanent error encountered.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut f: F) -> Result<T, ChatError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChatError>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    warn!(error = %e, max_retries = config.max_retries, "retries exhausted");
                    return Err(e);
                }

                let delay = apply_jitter(backoff, config.jitter);
                warn!(
                    error = %e,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off"
                );

                tokio::time::sleep(delay).await;

                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(config.max_backoff.as_millis() as f64)) as u64,
                );
            }
        }
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}
