//! Store call retry utilities.
//!
//! Wraps remote store calls in a per-attempt timeout plus exponential
//! backoff for transient failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::error::StoreError;

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
    /// Upper bound on a single attempt before it counts as timed out.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a config for quick retries (small, jitter-free backoffs).
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            add_jitter: false,
            call_timeout: Duration::from_millis(250),
        }
    }

    /// Calculate backoff duration for a given attempt.
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = (backoff_ms as f64 * 0.25 * rand_jitter()) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Execute a store call with a per-attempt timeout, retrying transient
/// failures with exponential backoff.
///
/// The closure is re-invoked for every attempt, so the work it wraps must be
/// idempotent or otherwise guarded by the caller.
pub async fn retry_store_call<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    f: F,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;

    loop {
        let outcome = match timeout(config.call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(config.call_timeout)),
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation,
                        attempt = attempt + 1,
                        "store call succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_transient() {
                    warn!(
                        operation,
                        error = %err,
                        "store call failed with permanent error, not retrying"
                    );
                    return Err(err);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "store call failed after max retries"
                    );
                    return Err(err);
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient store error, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_config_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = RetryConfig {
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
    }

    #[test]
    fn backoff_caps_at_max() {
        let config = RetryConfig {
            add_jitter: false,
            max_backoff: Duration::from_millis(300),
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(5), Duration::from_millis(300));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::BatchUnsupported.is_transient());
        assert!(!StoreError::Corrupt {
            collection: "invoices".into(),
            reason: "bad balance".into()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let config = RetryConfig::default();
        let result = retry_store_call(&config, "get", || async { Ok::<_, StoreError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let config = RetryConfig::quick();
        let calls = AtomicU32::new(0);
        let result = retry_store_call(&config, "update", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::BatchUnsupported) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_then_succeeds() {
        let config = RetryConfig::quick();
        let calls = AtomicU32::new(0);
        let result = retry_store_call(&config, "query", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let config = RetryConfig::quick();
        let calls = AtomicU32::new(0);
        let result = retry_store_call(&config, "insert", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::Unavailable("still down".into())) }
        })
        .await;

        assert!(matches!(result.unwrap_err(), StoreError::Unavailable(_)));
        // initial attempt + two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let config = RetryConfig {
            max_retries: 0,
            call_timeout: Duration::from_millis(20),
            ..RetryConfig::quick()
        };
        let result = retry_store_call(&config, "get", || async {
            std::future::pending::<Result<(), StoreError>>().await
        })
        .await;

        assert!(matches!(result.unwrap_err(), StoreError::Timeout(_)));
    }
}
