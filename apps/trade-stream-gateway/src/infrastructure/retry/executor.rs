//! Retry Executor
//!
//! Runs a fallible async action until it succeeds, sleeping between
//! failures according to a [`BackoffStrategy`]. There is no attempt limit;
//! only the delay is capped. Cancellation is checked at every suspension
//! point and surfaces as [`RetryError::Cancelled`], never as another retry.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::backoff::BackoffStrategy;

/// Outcome of a retry loop that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// The cancel signal fired.
    #[error("retry cancelled")]
    Cancelled,
}

/// Retries an action with backoff until success or cancellation.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    backoff: Arc<dyn BackoffStrategy>,
}

impl RetryExecutor {
    /// Create an executor using `backoff` between attempts.
    #[must_use]
    pub fn new(backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self { backoff }
    }

    /// Run `action` until it returns `Ok`.
    ///
    /// After the k-th failure the executor waits `backoff.delay(k)` before
    /// the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Cancelled`] if `cancel` fires before an attempt,
    /// during an attempt, or while waiting out a delay.
    pub async fn execute<T, E, F, Fut>(
        &self,
        mut action: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = action() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempts = attempt + 1, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.delay(attempt);
            tracing::warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Attempt failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
