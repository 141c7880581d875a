use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    /// Pause after every successful call to stay under the write-rate ceiling.
    pub write_delay: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            write_delay: Duration::from_secs(1),
        }
    }
}

impl WritePolicy {
    /// Linear backoff: `(attempt_index + 1) * base_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct PermanentWriteError {
    pub operation: String,
    pub attempts: usize,
    #[source]
    pub source: StoreError,
}

/// Sole path for remote store calls. Never panics on failure; the caller gets
/// a [`PermanentWriteError`] and decides how to continue.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: WritePolicy,
}

impl RetryExecutor {
    pub fn new(policy: WritePolicy) -> Self {
        Self { policy }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<T, PermanentWriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            match op().await {
                Ok(value) => {
                    if !self.policy.write_delay.is_zero() {
                        tokio::time::sleep(self.policy.write_delay).await;
                    }
                    return Ok(value);
                }
                Err(err) => {
                    // Rate-limit waits also apply after the final attempt so the
                    // next record does not hit the quota immediately.
                    if err.classify() == FailureClass::RateLimited {
                        let wait = self.policy.delay_for_attempt(attempt);
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            wait_secs = wait.as_secs_f64(),
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        debug!(operation, attempt = attempt + 1, error = %err, "store call failed");
                    }

                    attempt += 1;
                    if attempt >= max_attempts {
                        error!(operation, attempts = attempt, error = %err, "store call failed after retries");
                        return Err(PermanentWriteError {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                }
            }
        }
    }
}
