//! crates/likeshelf_core/src/retry.rs
//!
//! Capped exponential backoff for calls that can fail transiently.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ports::PortResult;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// `min(max_delay, initial_delay * multiplier^attempt)`, where `attempt` counts
    /// failures so far starting at 0.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retriable error, or
/// `policy.max_attempts` is used up. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> PortResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PortResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retriable() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
