// Error types for workers and the pool

use std::time::Duration;

use muxpool_protocol::{error_codes, RpcError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::worker::WorkerStatus;

/// Errors raised by a single worker
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// Worker failed to spawn or did not signal readiness in time
    #[error("worker {worker_id} failed to start: {reason}")]
    Startup { worker_id: String, reason: String },

    /// No correlated response before the deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Process exited or was stopped while the request was pending
    #[error("worker terminated")]
    Terminated,

    /// Worker already carries its maximum number of requests
    #[error("worker is at capacity")]
    AtCapacity,

    /// Worker is not in a state that accepts requests
    #[error("worker is not accepting requests (status: {0})")]
    NotAccepting(WorkerStatus),
}

/// Errors raised by the pool
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Pool saturated and no worker became available in time
    #[error("no available workers after waiting {0:?}")]
    NoAvailableWorker(Duration),

    /// Pool is shutting down
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// Pool background tasks are already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Worker-level failure
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PoolError {
    /// JSON-RPC error code reported to external callers
    pub fn code(&self) -> i64 {
        match self {
            Self::NoAvailableWorker(_) => error_codes::NO_AVAILABLE_WORKER,
            Self::ShuttingDown => error_codes::SHUTTING_DOWN,
            Self::Worker(WorkerError::Startup { .. }) => error_codes::WORKER_STARTUP,
            Self::Worker(WorkerError::Timeout(_)) => error_codes::DISPATCH_TIMEOUT,
            Self::Worker(WorkerError::Terminated) => error_codes::WORKER_TERMINATED,
            Self::Worker(WorkerError::AtCapacity | WorkerError::NotAccepting(_)) => {
                error_codes::NO_AVAILABLE_WORKER
            }
            Self::AlreadyRunning | Self::Config(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Convert into a JSON-RPC error object
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::new(self.code(), self.to_string())
    }
}
