// Wire Protocol for Gateway <-> Worker Communication
//
// Decision: JSON-RPC 2.0, one object per line, on stdin/stdout
// Decision: Readiness is announced on stderr so stdout carries protocol traffic only
// Decision: Malformed lines are reported per line; the stream itself keeps going

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{write_line, LineReader};
pub use error::ProtocolError;
pub use message::{Request, Response, RpcError, JSONRPC_VERSION};

/// Literal marker a worker writes to stderr once it accepts requests.
pub const READY_MARKER: &str = "MUXPOOL_WORKER_READY";

/// JSON-RPC error codes used across the gateway and the pool.
///
/// The `-32700..=-32600` range is reserved by JSON-RPC 2.0; the `-320xx`
/// codes are server errors defined by muxpool.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const CIRCUIT_OPEN: i64 = -32001;
    pub const NO_AVAILABLE_WORKER: i64 = -32002;
    pub const DISPATCH_TIMEOUT: i64 = -32003;
    pub const WORKER_TERMINATED: i64 = -32004;
    pub const WORKER_STARTUP: i64 = -32005;
    pub const SHUTTING_DOWN: i64 = -32006;

    /// Generic application failure reported by a worker
    pub const SERVER_ERROR: i64 = -32000;

    /// Whether a code signals a server-side failure (as opposed to a bad request).
    pub fn is_server_error(code: i64) -> bool {
        code == INTERNAL_ERROR || (-32099..=-32000).contains(&code)
    }
}
