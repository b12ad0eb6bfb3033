use std::time::Duration;

use tracing::{info, warn};

/// Fixed-delay retry budget for establishing bus connections.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one. Treated as at least 1.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

/// Runs `operation` until it succeeds, the error is not retryable, or the
/// budget is spent. Sleeps on the calling thread between attempts.
pub fn retry_with_fixed_delay<T, E>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: impl FnMut() -> Result<T, E>,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, RetryFailure<E>>
where
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation() {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        error = %error,
                        "operation failed permanently"
                    );
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }

                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    error = %error,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    "transient failure, retrying"
                );
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
        }
    }
}
