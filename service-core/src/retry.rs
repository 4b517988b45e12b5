//! Bounded retry with exponential backoff and a per-attempt timeout.
//!
//! Used for outbound deliveries (mail relays, SMS gateways, webhooks) where
//! a transient failure deserves another try but never an unbounded one.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with the specified max retries and attempt timeout.
    pub fn new(max_retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_retries,
            attempt_timeout,
            ..Default::default()
        }
    }

    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter && backoff_ms > 0 {
            // Up to 25% jitter
            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 4);
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Final outcome of an operation that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(E),
}

/// Run `f` until it succeeds, the retry budget is spent, or an attempt
/// reports a non-retryable error.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    f: F,
) -> Result<T, RetryError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        let outcome = match timeout(config.attempt_timeout, f()).await {
            Ok(Ok(value)) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Ok(Err(e)) => RetryError::Failed(e),
            Err(_) => RetryError::Timeout(config.attempt_timeout),
        };

        let retryable = match &outcome {
            RetryError::Timeout(_) => true,
            RetryError::Failed(e) => is_retryable(e),
        };

        if !retryable {
            warn!(
                operation = operation_name,
                error = %outcome,
                "Operation failed with permanent error, not retrying"
            );
            return Err(outcome);
        }

        if attempt >= config.max_retries {
            warn!(
                operation = operation_name,
                attempt = attempt + 1,
                error = %outcome,
                "Operation failed after max retries"
            );
            return Err(outcome);
        }

        let backoff = config.backoff_duration(attempt);
        warn!(
            operation = operation_name,
            attempt = attempt + 1,
            error = %outcome,
            backoff_ms = backoff.as_millis() as u64,
            "Operation failed, retrying after backoff"
        );

        sleep(backoff).await;
        attempt += 1;
    }
}
