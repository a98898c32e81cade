//! JSON-RPC 2.0 message model.
//!
//! Inbound frames are classified into one of three [`Message`] shapes:
//!
//! | Shape          | Required members                 |
//! |----------------|----------------------------------|
//! | `Request`      | `id`, `method`, optional `params` |
//! | `Response`     | `id`, exactly one of `result` / `error` |
//! | `Notification` | `method`, optional `params`, no `id` |
//!
//! Anything else is a decode error: the dispatch loop logs it and moves on.
//! Outbound frames are built with [`request_frame`], [`notification_frame`]
//! and [`response_frame`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::{Result, RpcError};

/// Protocol version string carried in every outbound frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Correlation id of a request.
///
/// The client only ever allocates numeric ids; string ids appear on
/// requests initiated by the server and are echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(u64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Numeric value of the id, if it has one.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// JSON-RPC error object (`{code, message, data?}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Short human-readable description.
    pub message: String,
    /// Optional server-defined payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Build an error object without `data`.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `-32601` for a method nobody handles.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32603` with the given description.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl Display for ErrorObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call that expects a response.
    Request {
        /// Correlation id.
        id: RequestId,
        /// Method name.
        method: String,
        /// Parameters (`Value::Null` when absent).
        params: Value,
    },
    /// Answer to an earlier request.
    Response {
        /// Correlation id of the answered request.
        id: RequestId,
        /// `result` on success, `error` otherwise.
        outcome: std::result::Result<Value, ErrorObject>,
    },
    /// One-way message without an id.
    Notification {
        /// Method name.
        method: String,
        /// Parameters (`Value::Null` when absent).
        params: Value,
    },
}

impl Message {
    /// Classify a single frame.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Decode`]`("malformed json: …")` if the frame is not JSON.
    /// - [`RpcError::Decode`]`("batch messages are not supported")` for a top-level array.
    /// - [`RpcError::Decode`]`("unrecognised message shape …")` for valid JSON
    ///   that is neither request, response nor notification.
    pub fn parse(frame: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| RpcError::Decode(format!("malformed json: {e}")))?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Same as [`Message::parse`] minus the JSON syntax case.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_array() {
            return Err(RpcError::Decode("batch messages are not supported".into()));
        }
        if !value.is_object() {
            return Err(RpcError::Decode(format!(
                "unrecognised message shape: expected an object, got {value}"
            )));
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| RpcError::Decode(format!("unrecognised message shape: {e}")))?;

        match (envelope.id, envelope.method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method,
                params: envelope.params.unwrap_or(Value::Null),
            }),
            (None, Some(method)) => Ok(Self::Notification {
                method,
                params: envelope.params.unwrap_or(Value::Null),
            }),
            (Some(id), None) => match (envelope.result, envelope.error) {
                (_, Some(error)) => Ok(Self::Response {
                    id,
                    outcome: Err(error),
                }),
                (Some(result), None) => Ok(Self::Response {
                    id,
                    outcome: Ok(result),
                }),
                (None, None) => Err(RpcError::Decode(format!(
                    "unrecognised message shape: id {id} without result, error or method"
                ))),
            },
            (None, None) => {
                let detail = envelope
                    .error
                    .map_or_else(|| "no id and no method".to_owned(), |e| format!("error without id: {e}"));
                Err(RpcError::Decode(format!(
                    "unrecognised message shape: {detail}"
                )))
            }
        }
    }

    /// Serialise the message into its wire representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => request_frame(id, method, params),
            Self::Response { id, outcome } => response_frame(id, outcome),
            Self::Notification { method, params } => notification_frame(method, params),
        }
    }
}

/// Build an outbound request frame.
#[must_use]
pub fn request_frame(id: &RequestId, method: &str, params: &Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build an outbound notification frame.
#[must_use]
pub fn notification_frame(method: &str, params: &Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

/// Build an outbound response frame for a server-initiated request.
#[must_use]
pub fn response_frame(id: &RequestId, outcome: &std::result::Result<Value, ErrorObject>) -> Value {
    match outcome {
        Ok(result) => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": result,
        }),
        Err(error) => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": error,
        }),
    }
}

// ── Inbound envelope ──────────────────────────────────────────────────────────

/// Loose view over any inbound frame; the shape is decided afterwards.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    /// `Some(Value::Null)` for `"result": null`, `None` when absent.
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

/// Distinguish a present-but-null member from an absent one.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
