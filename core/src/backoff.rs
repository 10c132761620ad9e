use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential retry for operations that run once at startup, such as
/// connecting a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn delays(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.5,
            multiplier: 2.0,
            max_interval: MAX_DELAY,
            // Attempts bound the retries, not wall time
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `operation` until it succeeds, fails with an error that
    /// `is_retryable` rejects, or uses up its attempts.
    pub async fn run<F, Fut, T, E, R>(&self, name: &str, is_retryable: R, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&E) -> bool,
    {
        let mut delays = self.delays();
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "Succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(&err) {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                warn!(operation = name, attempt, error = %err, "Giving up");
                return Err(err);
            }

            let Some(delay) = delays.next_backoff() else {
                warn!(operation = name, attempt, error = %err, "Backoff exhausted");
                return Err(err);
            };

            warn!(
                operation = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
