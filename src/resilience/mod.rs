//! Resilience primitives: retry with exponential backoff and circuit breakers.

pub mod circuit_breaker;
pub mod retry;
