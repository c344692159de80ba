// Gateway error types

use muxpool_pool::{CircuitBreakerError, PoolError};
use muxpool_protocol::{error_codes, ProtocolError, RpcError};
use thiserror::Error;

/// Errors raised by the gateway front end
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Breaker rejected the call without reaching the pool
    #[error("circuit breaker open: {0}")]
    CircuitOpen(#[from] CircuitBreakerError),

    /// Pool failed to place or complete the request
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Input or output stream failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl GatewayError {
    /// Convert into the JSON-RPC error object sent back to the caller
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::CircuitOpen(_) => RpcError::new(error_codes::CIRCUIT_OPEN, self.to_string()),
            Self::Pool(e) => e.to_rpc_error(),
            Self::Protocol(e) => RpcError::internal(e.to_string()),
        }
    }
}

/// Errors loading gateway configuration
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] muxpool_pool::ConfigError),
}
