//! Fixed-attempt retry for whole fork lifecycles.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// All attempts failed.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryError<E: std::fmt::Display> {
    pub attempts: usize,
    pub last: E,
}

/// Runs an operation up to a fixed number of times.
///
/// Every attempt is independent; the closure receives the 1-based attempt
/// number and must start from a clean slate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: usize,
    delay: Duration,
}

impl RetryPolicy {
    /// `attempts` tries in total (minimum 1), back to back.
    pub fn fixed(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
            delay: Duration::ZERO,
        }
    }

    /// Waits `delay` between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Runs `operation` until it succeeds or the attempts run out.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{} failed: {}; retrying",
                        attempt, self.attempts, e
                    );
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
