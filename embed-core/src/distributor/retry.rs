// embed-core/src/distributor/retry.rs

//! Retry policy of the local cluster executor.
//!
//! Failed partition tasks are resubmitted with exponential backoff and a
//! little jitter. Resubmission is safe because enumeration is restartable
//! and a reopened shard writer discards the previous attempt.

use std::future::Future;
use std::time::Duration;

use super::cancel::CancelToken;
use crate::config::DistributorConfig;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&DistributorConfig> for RetryConfig {
    fn from(config: &DistributorConfig) -> Self {
        Self {
            max_retries: config.max_task_retries,
            initial_delay: Duration::from_millis(config.retry_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration with no retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Calculates the delay before retry `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        let delay_secs = if self.jitter {
            // Up to 25% extra
            delay_secs * (1.0 + jitter_fraction(attempt) * 0.25)
        } else {
            delay_secs
        };

        Duration::from_secs_f64(delay_secs)
    }

    /// Returns true if retry `attempt` (0-indexed) is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Deterministic value in [0, 1) derived from the attempt number.
fn jitter_fraction(seed: u32) -> f64 {
    let x = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    f64::from(x) / (f64::from(u32::MAX) + 1.0)
}

/// Runs `operation` until `succeeded` accepts its output, retries run out,
/// or `cancel` fires. Returns the output of the last attempt.
pub async fn retry_async<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancelToken,
    succeeded: impl Fn(&T) -> bool,
    mut operation: F,
) -> T
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
{
    let mut attempt = 0;

    loop {
        let output = operation(attempt).await;
        if succeeded(&output) || !config.should_retry(attempt) || cancel.is_cancelled() {
            return output;
        }

        let delay = config.delay_for_attempt(attempt);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => return output,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    #[test]
    fn test_from_distributor_config() {
        let config = DistributorConfig {
            max_task_retries: 3,
            retry_delay_ms: 250,
            ..Default::default()
        };
        let retry = RetryConfig::from(&config);
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert!(retry.should_retry(2));
        assert!(!retry.should_retry(3));
    }

    #[test]
    fn test_no_retry() {
        let config = RetryConfig::no_retry();
        assert!(!config.should_retry(0));
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_retries: 5,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_respects_max() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_secs(10),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_with_jitter() {
        let config = RetryConfig {
            max_retries: 5,
            ..Default::default()
        };

        let delay = config.delay_for_attempt(0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let attempts = AtomicU32::new(0);
        let output = retry_async(&fast(5), &CancelToken::default(), |ok: &bool| *ok, |attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { attempt >= 2 }
        })
        .await;

        assert!(output);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let attempts = AtomicU32::new(0);
        let output = retry_async(&fast(2), &CancelToken::default(), |ok: &bool| *ok, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;

        assert!(!output);
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_retries() {
        let cancel = CancelToken::default();
        cancel.cancel();
        let attempts = AtomicU32::new(0);

        retry_async(&fast(5), &cancel, |ok: &bool| *ok, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { false }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
