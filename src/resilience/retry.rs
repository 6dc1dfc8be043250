// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two layers live here:
//! - [`retry`] with [`RetryConfig`] presets, for backend connections where
//!   every error is worth another attempt.
//! - [`exponential_delay`], [`add_jitter`] and [`spread_jitter`], the backoff
//!   arithmetic shared by the rate limiter and the error classifier.
//!
//! # Example
//!
//! ```
//! use crm_sync::RetryConfig;
//! use crm_sync::resilience::retry::exponential_delay;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let cap = Duration::from_secs(16);
//! assert_eq!(exponential_delay(Duration::from_secs(1), 3, cap), Duration::from_secs(4));
//! assert_eq!(exponential_delay(Duration::from_secs(1), 9, cap), cap);
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// `base * 2^(attempt - 1)`, capped. Attempt 0 and 1 both yield `base`.
#[must_use]
pub fn exponential_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Add up to `max_fraction` of `delay` on top (never shortens the wait).
#[must_use]
pub fn add_jitter(delay: Duration, max_fraction: f64) -> Duration {
    if max_fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = rand::rng().random_range(0.0..=max_fraction);
    delay + delay.mul_f64(extra)
}

/// Scale `delay` by a random factor in `[1 - fraction, 1 + fraction]`.
#[must_use]
pub fn spread_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = fraction.min(1.0);
    let factor = rand::rng().random_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("always fail".to_string()))
                }
            },
        ).await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::query().initial_delay, Duration::from_millis(100));
        assert_eq!(RetryConfig::query().max_retries, Some(3));
    }

    #[test]
    fn test_exponential_delay_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=8).map(|a| exponential_delay(base, a, cap).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(exponential_delay(base, 0, cap), base);
        assert_eq!(exponential_delay(base, u32::MAX, cap), cap);
    }

    #[test]
    fn test_add_jitter_bounds() {
        let delay = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = add_jitter(delay, 0.1);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_secs(11));
        }
        assert_eq!(add_jitter(Duration::ZERO, 0.1), Duration::ZERO);
    }

    #[test]
    fn test_spread_jitter_bounds() {
        let delay = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = spread_jitter(delay, 0.1);
            assert!(jittered >= Duration::from_secs(9));
            assert!(jittered <= Duration::from_secs(11));
        }
    }
}
