use std::future::Future;
use std::time::Duration;

use crate::errors::StoreError;

/// Exponential backoff for store calls that hit throttling or a dropped
/// connection. Non-transient errors are returned on the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (0-based). The first attempt never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.base_delay * 2_u32.saturating_pow(attempt - 1)
        }
    }
}

pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            tracing::debug!(
                "{} attempt {}/{}, waiting {}ms",
                operation,
                attempt + 1,
                max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }

        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        "{} succeeded on attempt {}/{}",
                        operation,
                        attempt + 1,
                        max_attempts
                    );
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                tracing::warn!(
                    "{} attempt {}/{} failed: {}",
                    operation,
                    attempt + 1,
                    max_attempts,
                    e
                );
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!("{} failed after {} attempts: {}", operation, max_attempts, e);
                }
                return Err(e);
            }
        }
    }

    unreachable!("retry loop always returns on its last attempt")
}
