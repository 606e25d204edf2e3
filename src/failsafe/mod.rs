//! Failsafe mechanisms protecting the upstream identity provider
//!
//! The retry layer sits *inside* the circuit breaker: one logical operation
//! that exhausted its retries counts as a single failure toward the
//! breaker, so retries never inflate the failure counters.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use retry::{with_retry, RetryPolicy};
