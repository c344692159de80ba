//! # Worker Process Pool
//!
//! Spawns identical long-lived worker processes that speak newline-delimited
//! JSON-RPC over stdio and multiplexes concurrent requests across them.
//!
//! ## Features
//!
//! - **Least-connections balancing**: requests go to the worker with the fewest in flight
//! - **Auto-scaling**: on-demand and proactive scale-up, idle scale-down, never outside bounds
//! - **Health probing**: periodic probes on a separate lane; unhealthy workers are replaced
//! - **Request correlation**: many requests share one stdio pair, matched by internal ids
//! - **Reliability primitives**: circuit breaker and retry policy with jittered backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Pool                              │
//! │  (selection, scaling, replacement on exit events)           │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                   ▲
//!              ▼                                   │ WorkerEvent
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerHandle × N                      │
//! │  (stdin writer, stdout reader, stderr reader, supervisor)   │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                   ▲
//!              ▼                                   │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   worker child processes                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
mod health;
pub mod pool;
pub mod reliability;
mod scaling;
pub mod worker;

pub use config::{ConfigError, PoolConfig, WorkerSpec};
pub use error::{PoolError, WorkerError};
pub use pool::{Pool, PoolStatus};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPermit,
    CircuitBreakerSnapshot, CircuitState, RetryPolicy,
};
pub use worker::{WorkerEvent, WorkerHandle, WorkerHealth, WorkerSnapshot, WorkerStatus};
