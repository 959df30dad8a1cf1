//! Retry and timeout helpers for recoverable failures
//!
//! Reconnection and other flaky operations run through
//! [`retry_with_backoff`], which retries only errors that
//! [`SessionError::is_recoverable`] classifies as transient. The delay
//! doubles per attempt up to a cap, with optional jitter to keep a fleet
//! of clients from reconnecting in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// Shape of one retry loop
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomize each delay within +/-25%
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short loop for lightweight calls
    pub fn quick() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Patient loop for full session recovery
    pub fn slow() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            ..Default::default()
        }
    }

    /// Delay before the given retry (attempt is 1-based; the delay runs
    /// after that attempt fails).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let ms = if self.use_jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }
}

/// Run an operation with bounded retries of recoverable errors.
///
/// Non-recoverable errors propagate immediately. When every attempt
/// fails, the last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> SessionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SessionResult<T>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_recoverable() => {
                warn!(operation = operation_name, error = %e, "non-recoverable, giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "attempt failed"
                );
                last_error = Some(e);
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        SessionError::internal(format!("{operation_name} failed with no attempts made"))
    }))
}

/// Bound an operation with a timeout, mapping expiry to an internal error
pub async fn with_timeout<Fut, T>(
    operation_name: &str,
    timeout: Duration,
    future: Fut,
) -> SessionResult<T>
where
    Fut: Future<Output = SessionResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::internal(format!(
            "{operation_name} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
