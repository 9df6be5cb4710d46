//! Retry logic with exponential backoff
//!
//! This module provides bounded retry for transient failures with exponential
//! backoff and optional jitter to prevent thundering herd. Callers may supply
//! a failed-attempt hook that observes each failure and can override the next
//! delay, which is how washers honor rate-limit retry-after headers.
//!
//! # Example
//!
//! ```no_run
//! use laundromat::retry::retry_with_backoff;
//! use laundromat::config::RetryConfig;
//!
//! # async fn example() -> Result<(), std::io::Error> {
//! let config = RetryConfig::default();
//! let result = retry_with_backoff(&config, None, || async {
//!     // Your operation here
//!     Ok::<_, std::io::Error>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// A hook invoked on each failed attempt.
///
/// Receives the error and the 1-based attempt number. Returning `Some`
/// replaces the computed backoff delay for the next attempt (e.g. with a
/// server-provided retry-after duration).
pub type FailedAttemptHook<'a, E> = &'a (dyn Fn(&E, u32) -> Option<Duration> + Send + Sync);

/// Execute an async operation with bounded retry and exponential backoff.
///
/// Every failure is retried until `config.max_attempts` retries are
/// exhausted; the last error is then returned. The optional hook runs on
/// each failure before the wait, and may override the delay.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    on_failed_attempt: Option<FailedAttemptHook<'_, E>>,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt < config.max_attempts => {
                attempt += 1;

                let override_delay = on_failed_attempt.and_then(|hook| hook(&e, attempt));

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    "Operation failed, retrying"
                );

                let wait = match override_delay {
                    Some(d) => d,
                    None if config.jitter => add_jitter(delay),
                    None => delay,
                };

                tokio::time::sleep(wait).await;

                // Next delay grows exponentially, capped at max_delay
                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    attempts = attempt + 1,
                    "Operation failed after all retry attempts exhausted"
                );
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd.
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay falls between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
