//! Reliability patterns
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with jitter for idempotent management calls
//! - [`CircuitBreaker`] - Consecutive-failure breaker guarding dispatch

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPermit,
    CircuitBreakerSnapshot, CircuitState,
};
pub use retry::RetryPolicy;
