//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::time::sleep;
use tracing::debug;

use crate::Error;

/// Retry policy for upstream HTTP calls
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per logical call
    pub max_attempts: u32,
    /// Minimum wait between attempts
    pub wait_min: Duration,
    /// Maximum wait between attempts
    pub wait_max: Duration,
}

impl RetryPolicy {
    /// Create a policy with the standard 200 ms - 1 s backoff band
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            wait_min: Duration::from_millis(200),
            wait_max: Duration::from_secs(1),
        }
    }

    /// Create an exponential backoff instance
    #[must_use]
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.wait_min,
            initial_interval: self.wait_min,
            max_interval: self.wait_max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Execute a future with retry logic
///
/// Transport errors and 5xx responses are retried; anything else propagates
/// immediately.
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut backoff = policy.create_backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                if attempts >= policy.max_attempts {
                    debug!(
                        operation = name,
                        attempts = attempts,
                        "max retry attempts reached"
                    );
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    debug!(
                        operation = name,
                        attempt = attempts,
                        delay_ms = duration.as_millis(),
                        error = %e,
                        "retrying after backoff"
                    );
                    sleep(duration).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

/// Check if an error is retryable at the per-request layer
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Transport(_) | Error::Http(_) => true,
        Error::UpstreamStatus { status, .. } => *status >= 500,
        _ => false,
    }
}
