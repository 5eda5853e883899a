// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around the remote document store, backed by `recloser`.
//!
//! The sync processor sends every remote write through one breaker. Once
//! the remote keeps failing, the breaker opens and calls are rejected
//! without touching the network, so queued mutations wait for a later pass
//! instead of spending their retry budget against a dead backend.
//!
//! ```text
//!   Closed ──(failures ≥ threshold)──► Open ──(recovery_timeout)──► HalfOpen
//!     ▲                                                               │
//!     └──────────────(success_threshold probes succeed)───────────────┘
//! ```
//!
//! Only errors that say something about the remote's health should count.
//! [`CircuitBreaker::call_if`] takes a predicate for that; a rejected
//! document (bad argument, missing, permission) passes through without
//! moving the breaker.

use parking_lot::Mutex;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::Open,
            1 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Breaker is open; the operation was never started
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => Self::Rejected,
            RecloserError::Inner(e) => Self::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failed calls, out of the last `failure_threshold`, that trip the breaker
    pub failure_threshold: u32,
    /// Probe calls that must succeed while half-open before closing again
    pub success_threshold: u32,
    /// Time spent open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips on two failures and probes again after 50ms.
    #[must_use]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Call counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    /// Errors counted against the breaker
    pub failures: u64,
    /// Errors the predicate passed through without counting
    pub ignored: u64,
    pub rejections: u64,
}

impl CircuitStats {
    /// Counted failures over calls that reached the operation.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.calls - self.rejections;
        if attempted == 0 {
            0.0
        } else {
            self.failures as f64 / attempted as f64
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    /// recloser keeps its state private; this mirrors what calls observed
    state: AtomicU8,
    stats: Mutex<CircuitStats>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        // recloser trips on a failure *rate* over a ring of `closed_len`
        // calls; a rate just above zero makes a full ring of failures trip it
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            stats: Mutex::new(CircuitStats::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last state inferred from call outcomes.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        *self.stats.lock()
    }

    fn observe(&self, next: CircuitState) {
        let previous = CircuitState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if previous == next {
            return;
        }
        metrics::set_circuit_state(&self.name, next as u8);
        match next {
            CircuitState::Open => warn!(circuit = %self.name, "Circuit opened"),
            _ => info!(circuit = %self.name, from = %previous, to = %next, "Circuit state changed"),
        }
    }

    /// Run `f` through the breaker, counting every error as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_if(|_: &E| true, f).await
    }

    /// Run `f` through the breaker. Errors for which `is_failure` returns
    /// false are handed back without counting toward tripping.
    pub async fn call_if<P, F, Fut, T, E>(&self, is_failure: P, f: F) -> Result<T, CircuitError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = self.inner.call_with(&is_failure, f()).await;

        let mut stats = self.stats.lock();
        stats.calls += 1;
        match outcome {
            Ok(value) => {
                stats.successes += 1;
                drop(stats);
                self.observe(CircuitState::Closed);
                metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                stats.rejections += 1;
                drop(stats);
                self.observe(CircuitState::Open);
                debug!(circuit = %self.name, "Call rejected");
                metrics::record_circuit_breaker_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                let counted = is_failure(&e);
                if counted {
                    stats.failures += 1;
                } else {
                    stats.ignored += 1;
                }
                drop(stats);
                let outcome = if counted { "failure" } else { "ignored" };
                debug!(circuit = %self.name, outcome, "Call failed");
                metrics::record_circuit_breaker_call(&self.name, outcome);
                Err(CircuitError::Inner(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum RemoteFault {
        Unavailable,
        NotFound,
    }

    fn is_outage(e: &RemoteFault) -> bool {
        *e == RemoteFault::Unavailable
    }

    async fn fail(cb: &CircuitBreaker, fault: RemoteFault) -> Result<u32, CircuitError<RemoteFault>> {
        cb.call_if(is_outage, || async move { Err(fault) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitError<RemoteFault>> {
        cb.call_if(is_outage, || async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_success_keeps_circuit_closed() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats(), CircuitStats { calls: 1, successes: 1, ..Default::default() });
        assert_eq!(cb.name(), "remote");
    }

    #[tokio::test]
    async fn test_outages_open_the_circuit() {
        let cb = CircuitBreaker::new("remote", CircuitConfig { recovery_timeout: Duration::from_secs(60), ..CircuitConfig::test() });

        assert!(matches!(fail(&cb, RemoteFault::Unavailable).await, Err(CircuitError::Inner(RemoteFault::Unavailable))));
        assert!(matches!(fail(&cb, RemoteFault::Unavailable).await, Err(CircuitError::Inner(_))));

        // Open now: the operation is not even started
        let started = std::sync::atomic::AtomicBool::new(false);
        let result: Result<u32, CircuitError<RemoteFault>> = cb
            .call(|| async {
                started.store(true, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert!(!started.load(Ordering::SeqCst));
        assert!(cb.is_open());
        assert_eq!(cb.stats().rejections, 1);
    }

    #[tokio::test]
    async fn test_rejected_documents_do_not_trip() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());

        for _ in 0..5 {
            assert!(matches!(fail(&cb, RemoteFault::NotFound).await, Err(CircuitError::Inner(RemoteFault::NotFound))));
        }

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        let stats = cb.stats();
        assert_eq!(stats.ignored, 5);
        assert_eq!(stats.failures, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_recovers_after_timeout() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());
        let _ = fail(&cb, RemoteFault::Unavailable).await;
        let _ = fail(&cb, RemoteFault::Unavailable).await;
        assert!(matches!(succeed(&cb).await, Err(CircuitError::Rejected)));

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failure_rate_excludes_rejections() {
        let cb = CircuitBreaker::new("remote", CircuitConfig { failure_threshold: 1000, ..CircuitConfig::default() });

        let _ = succeed(&cb).await;
        let _ = fail(&cb, RemoteFault::Unavailable).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb, RemoteFault::NotFound).await;

        let stats = cb.stats();
        assert_eq!(stats.calls, 4);
        assert!((stats.failure_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(CircuitStats::default().failure_rate(), 0.0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
