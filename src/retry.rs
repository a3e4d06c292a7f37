// 🔁 Retry Policy - Bounded retries for external ledger calls
//
// Only errors that report `is_retryable()` are retried. Validation,
// authentication and not-found failures return immediately and abort just the
// record that triggered them.

use crate::error::Result;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Configuration for retry behavior
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Backoff before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for a single backoff
    pub max_backoff: Duration,

    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,

    /// Total time budget across all attempts; no new attempt starts after it
    pub deadline: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            deadline: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retries without sleeping, for tests and in-process collaborators
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            deadline: Duration::from_secs(60),
        }
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        Duration::from_millis(backoff_ms)
    }
}

/// Run `f` until it succeeds, fails permanently, or the retry budget is spent
pub fn with_retry<T, F>(config: &RetryConfig, operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        match f() {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "Call failed with permanent error, not retrying"
                    );
                    return Err(err);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Call failed after max retries"
                    );
                    return Err(err);
                }

                let backoff = config.backoff_duration(attempt);
                if started.elapsed() + backoff > config.deadline {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Retry deadline exceeded"
                    );
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleep(backoff);
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
