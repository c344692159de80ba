//! JSON-RPC 2.0 request and response objects

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::error_codes;

/// Protocol version string carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request (or notification, when `id` is absent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,

    /// Caller-supplied id. `Some(Value::Null)` is an explicit null id,
    /// `None` marks a notification.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,

    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a request with an id
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (no id, no response expected)
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse one protocol line into a request.
    ///
    /// Invalid JSON yields [`ProtocolError::Parse`]; JSON that is not a
    /// request object yields [`ProtocolError::InvalidMessage`] carrying the id
    /// when one was present.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    /// Validate and convert an already-parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(map) = value else {
            return Err(ProtocolError::invalid(None, "request must be a JSON object"));
        };

        let id = map.get("id").cloned();
        if let Some(id) = &id {
            if !is_valid_id(id) {
                return Err(ProtocolError::invalid(
                    None,
                    "id must be a string, a number or null",
                ));
            }
        }

        match map.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => return Err(ProtocolError::invalid(id, "jsonrpc must be \"2.0\"")),
        }

        if !matches!(map.get("method"), Some(Value::String(_))) {
            return Err(ProtocolError::invalid(id, "method must be a string"));
        }

        serde_json::from_value(Value::Object(map))
            .map_err(|e| ProtocolError::invalid(id, e.to_string()))
    }
}

/// A JSON-RPC response: exactly one of `result` or `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,

    pub id: Value,

    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Successful response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Parse one protocol line into a response
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(map) = value else {
            return Err(ProtocolError::invalid(None, "response must be a JSON object"));
        };
        let id = map.get("id").cloned();
        if id.is_none() {
            return Err(ProtocolError::invalid(None, "response has no id"));
        }
        if !map.contains_key("result") && !map.contains_key("error") {
            return Err(ProtocolError::invalid(
                id,
                "response has neither result nor error",
            ));
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| ProtocolError::invalid(id, e.to_string()))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Error code, if this is an error response
    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(error_codes::PARSE_ERROR, "Parse error").with_data(Value::String(detail.into()))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, "Invalid Request")
            .with_data(Value::String(detail.into()))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

fn is_valid_id(id: &Value) -> bool {
    matches!(id, Value::String(_) | Value::Number(_) | Value::Null)
}

/// Distinguish an explicit `null` from a missing field
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let req = Request::parse(r#"{"jsonrpc":"2.0","id":7,"method":"route","params":{"q":"hi"}}"#)
            .unwrap();
        assert_eq!(req.id, Some(json!(7)));
        assert_eq!(req.method, "route");
        assert_eq!(req.params, Some(json!({"q": "hi"})));
        assert!(!req.is_notification());
    }

    #[test]
    fn test_null_id_is_not_a_notification() {
        let req = Request::parse(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert_eq!(req.id, Some(Value::Null));
        assert!(!req.is_notification());

        let note = Request::parse(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(note.is_notification());
    }

    #[test]
    fn test_string_id_round_trips() {
        let req = Request::new("abc-1", "echo", None);
        let line = serde_json::to_string(&req).unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","id":"abc-1","method":"echo"}"#);
        assert_eq!(Request::parse(&line).unwrap(), req);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = Request::parse("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse(_)));
    }

    #[test]
    fn test_invalid_request_keeps_id() {
        let err = Request::parse(r#"{"jsonrpc":"2.0","id":3}"#).unwrap_err();
        match err {
            ProtocolError::InvalidMessage { id, .. } => assert_eq!(id, Some(json!(3))),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = Request::parse(r#"{"jsonrpc":"1.0","id":"x","method":"m"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage { id: Some(_), .. }));

        let err = Request::parse(r#"[1,2,3]"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage { id: None, .. }));

        let err = Request::parse(r#"{"jsonrpc":"2.0","id":{"a":1},"method":"m"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage { id: None, .. }));
    }

    #[test]
    fn test_response_null_result_is_preserved() {
        let resp = Response::parse(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(resp.result, Some(Value::Null));
        assert!(!resp.is_error());
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
    }

    #[test]
    fn test_response_error() {
        let resp = Response::parse(
            r#"{"jsonrpc":"2.0","id":"a","error":{"code":-32000,"message":"boom"}}"#,
        )
        .unwrap();
        assert!(resp.is_error());
        assert_eq!(resp.error_code(), Some(-32000));
        assert_eq!(resp.error.unwrap().message, "boom");
    }

    #[test]
    fn test_response_without_id_or_payload_is_invalid() {
        assert!(Response::parse(r#"{"jsonrpc":"2.0","result":1}"#).is_err());
        assert!(Response::parse(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(Response::parse("42").is_err());
    }

    #[test]
    fn test_failure_serialization() {
        let resp = Response::failure(json!(9), RpcError::method_not_found("nope"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], json!(9));
        assert_eq!(value["error"]["code"], json!(-32601));
        assert!(value.get("result").is_none());
    }
}
