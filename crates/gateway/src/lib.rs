//! # Muxpool Gateway
//!
//! Stdio JSON-RPC front end for a [`muxpool_pool::Pool`]. Each input line is
//! one request; each response is written as one line, in completion order,
//! carrying the caller's id.
//!
//! - A circuit breaker fails fast while the pool keeps failing
//! - `muxpool/status` and `muxpool/health` are answered locally
//! - Notifications are accepted and never answered

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod telemetry;

pub use cli::Cli;
pub use config::GatewayConfig;
pub use dispatcher::Dispatcher;
pub use error::{ConfigLoadError, GatewayError};
pub use gateway::{Gateway, HealthCounts, HealthReport, MANAGEMENT_PREFIX};
pub use telemetry::{init_tracing, LogFormat};
