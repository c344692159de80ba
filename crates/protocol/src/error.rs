// Protocol error types

use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding or encoding protocol lines
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Line is not valid JSON
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Line is valid JSON but not a well-formed JSON-RPC message
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Request id, when one could be recovered
        id: Option<Value>,
        reason: String,
    },

    /// Line contains bytes that are not UTF-8
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// Underlying stream failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn invalid(id: Option<Value>, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            id,
            reason: reason.into(),
        }
    }
}
