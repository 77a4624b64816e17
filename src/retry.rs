use std::time::Duration;

use crate::clock::Clock;
use crate::error::FetchFailure;

/// Bounded retries with exponential backoff around one adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Runs `operation` until it succeeds, fails terminally, or the attempt
    /// budget is spent. The closure receives the 1-based attempt number.
    /// A returned failure carries the number of attempts made.
    pub fn run<T, F>(&self, clock: &dyn Clock, mut operation: F) -> Result<T, FetchFailure>
    where
        F: FnMut(u32) -> Result<T, FetchFailure>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    if !failure.kind.is_retryable() || attempt >= max_attempts {
                        return Err(failure.with_attempts(attempt));
                    }
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        kind = %failure.kind,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after {}",
                        failure.detail
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
