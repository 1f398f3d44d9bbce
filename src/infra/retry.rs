//! Retry utilities with exponential backoff

use std::future::Future;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::LspError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backend (re)start policy: first start plus the restart budget
    pub fn for_backend_start(runtime: &RuntimeConfig) -> Self {
        Self {
            max_attempts: runtime.start_attempts(),
            initial_delay: runtime.restart_backoff,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Sum of the sleeps between all attempts
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Execute an async operation with retry and exponential backoff
///
/// Only errors for which [`LspError::is_recoverable`] holds are retried.
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut op: F) -> Result<T, LspError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LspError>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts.max(1) {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            tracing::debug!(
                "Retry attempt {}/{} after {:?}",
                attempt + 1,
                config.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_recoverable() && attempt + 1 < config.max_attempts => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}",
                    attempt + 1,
                    config.max_attempts,
                    e
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(LspError::RequestCancelled))
}
