// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for local storage and outbound requests.
//!
//! `max_retries` counts retries *after* the first attempt, so an operation
//! that always fails runs `max_retries + 1` times. The delay before retry
//! `n` is `min(initial_delay * factor^(n-1), max_delay)`.
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let request = RetryConfig::request();
//! assert_eq!(request.max_retries, Some(3));
//! assert_eq!(request.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(request.delay_for_attempt(3), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Retries after the first attempt; `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::request()
    }
}

impl RetryConfig {
    fn doubling(max_retries: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: 2.0,
            max_retries: Some(max_retries),
        }
    }

    /// API requests: 1s, 2s, 4s, capped at 30s.
    #[must_use]
    pub fn request() -> Self {
        Self::doubling(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Opening the on-device database. A locked file usually clears quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self::doubling(5, Duration::from_millis(200), Duration::from_secs(2))
    }

    /// Single reads and writes against local storage.
    #[must_use]
    pub fn query() -> Self {
        Self::doubling(3, Duration::from_millis(100), Duration::from_secs(2))
    }

    #[must_use]
    pub fn test() -> Self {
        Self::doubling(3, Duration::from_millis(1), Duration::from_millis(10))
    }

    /// Whether a failure after `retries` retries may be retried again.
    #[must_use]
    pub fn allows(&self, retries: usize) -> bool {
        self.max_retries.map_or(true, |max| retries < max)
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Retry every error.
pub async fn retry<F, Fut, T, E>(label: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(label, config, |_| true, operation).await
}

/// Retry errors accepted by `should_retry`; anything else is returned at once.
pub async fn retry_if<F, Fut, T, E, P>(label: &str, config: &RetryConfig, should_retry: P, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retries = 0usize;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(operation = label, retries, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) || !config.allows(retries) {
            return Err(err);
        }

        retries += 1;
        let delay = config.delay_for_attempt(retries as u32);
        warn!(
            operation = label,
            retry = retries,
            max = ?config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum DiskError {
        Locked,
        Full,
    }

    impl std::fmt::Display for DiskError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Locked => f.write_str("database is locked"),
                Self::Full => f.write_str("disk full"),
            }
        }
    }

    /// Fails with `Locked` for the first `failures` calls.
    async fn locked_for(calls: &AtomicUsize, failures: usize) -> Result<&'static str, DiskError> {
        if calls.fetch_add(1, Ordering::SeqCst) < failures {
            Err(DiskError::Locked)
        } else {
            Ok("opened")
        }
    }

    #[tokio::test]
    async fn test_lock_clears_before_budget_runs_out() {
        let calls = AtomicUsize::new(0);

        let result = retry("open_db", &RetryConfig::test(), || locked_for(&calls, 2)).await;

        assert_eq!(result, Ok("opened"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_first_attempt_plus_retries() {
        let calls = AtomicUsize::new(0);

        let result = retry("open_db", &RetryConfig::test(), || locked_for(&calls, usize::MAX)).await;

        assert_eq!(result, Err(DiskError::Locked));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unretryable_error_returns_immediately() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), DiskError> = retry_if(
            "write",
            &RetryConfig::test(),
            |e| *e == DiskError::Locked,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DiskError::Full)
            },
        )
        .await;

        assert_eq!(result, Err(DiskError::Full));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_backoff_schedule() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig::request();
        let started = Instant::now();

        let _ = retry("request", &config, || locked_for(&calls, usize::MAX)).await;

        // 1s + 2s + 4s
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[test]
    fn test_allows_respects_budget() {
        let config = RetryConfig::query();
        assert!(config.allows(0));
        assert!(config.allows(2));
        assert!(!config.allows(3));

        let forever = RetryConfig { max_retries: None, ..RetryConfig::test() };
        assert!(forever.allows(usize::MAX));
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryConfig::default(), RetryConfig::request());
        assert_eq!(RetryConfig::request().max_delay, Duration::from_secs(30));
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::startup().initial_delay, Duration::from_millis(200));
        assert_eq!(RetryConfig::query().initial_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let config = RetryConfig::request();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(200), Duration::from_secs(30));
    }
}
