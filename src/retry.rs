//! Retry loop for outer workflows
//!
//! The grant core never retries; a failed grant is retried as a whole by the
//! in-pod agent, which polls the grant endpoint until it succeeds.
//!
//! # Example
//!
//! ```ignore
//! use iam_sa_mapping::retry::{retry_at_interval, RetryConfig};
//!
//! let config = retry_at_interval(
//!     &RetryConfig::forever(Duration::from_secs(5)),
//!     "fetch_profiles",
//!     || async { fetcher.fetch(&run_id, &token).await },
//! ).await?;
//! ```

use std::time::Duration;

use tracing::{error, warn};

/// Fixed-interval retry policy
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay between attempts
    pub interval: Duration,
}

impl RetryConfig {
    /// Retry forever at a constant interval
    pub fn forever(interval: Duration) -> Self {
        Self {
            max_attempts: 0,
            interval,
        }
    }
}

/// Run an async operation until it succeeds or attempts run out
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_at_interval<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = config.interval.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(config.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_at_interval(&fast(3), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_at_interval(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn forever_has_no_attempt_limit() {
        let config = RetryConfig::forever(Duration::from_secs(5));
        assert_eq!(config.max_attempts, 0);
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_stays_constant_between_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let started = tokio::time::Instant::now();

        let result: Result<(), &str> =
            retry_at_interval(&RetryConfig::forever(Duration::from_secs(5)), "op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err("not yet")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    }
}
