use crate::core::{DbError, Result};
use std::time::Duration;
use tracing::debug;

/// Caller-side retry of operations that lost an optimistic race.
///
/// Only errors for which [`DbError::is_retryable`] holds are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Exponential backoff before attempt `attempt + 1`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn run<R, F>(&self, mut op: F) -> Result<R>
    where
        F: FnMut() -> Result<R>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.backoff_ms(attempt);
                    debug!(attempt, backoff_ms = backoff, error = %err, "Retrying after conflict");
                    std::thread::sleep(Duration::from_millis(backoff));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
