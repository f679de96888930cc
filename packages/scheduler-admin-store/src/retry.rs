//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// How often a failed batch write is attempted before it is dropped
///
/// Attempt `n` (0-based) waits `backoff * 2^(n-1)` before running, so the
/// default policy waits 100ms then 200ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay, in milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Delay before attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 1);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `is_transient` decides whether an error is worth another attempt. The
    /// last error is returned as is.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < attempts && is_transient(&err) => {
                    warn!(
                        what,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %err,
                        "transient failure, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
