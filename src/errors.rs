//! Error types shared across the client runtime.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::protocol::ErrorObject;

/// Shared client result type.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Client error enumeration covering every failure mode of the runtime.
///
/// Errors are [`Clone`] so that a single connection failure can be delivered
/// to every outstanding waiter.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// The agent process could not be spawned or failed its startup checks.
    Launch(String),
    /// The byte stream closed unexpectedly or could not be written.
    Transport(String),
    /// The server answered a request with a JSON-RPC error object.
    Protocol(ErrorObject),
    /// A local deadline elapsed before the server answered.
    Timeout {
        /// Method of the abandoned request.
        method: String,
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The pending call was cancelled locally.
    Cancelled(String),
    /// The client is not in the `Running` state.
    NotRunning(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// A frame could not be decoded into a JSON-RPC message.
    Decode(String),
    /// Params or results could not be converted to or from JSON.
    Serde(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl RpcError {
    /// Whether the error is scoped to the whole connection rather than a
    /// single call.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotRunning(_))
    }

    /// JSON-RPC error code when the server rejected the call.
    #[must_use]
    pub fn protocol_code(&self) -> Option<i64> {
        match self {
            Self::Protocol(obj) => Some(obj.code),
            _ => None,
        }
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(obj) => write!(f, "protocol: {obj}"),
            Self::Timeout { method, after } => {
                write!(f, "timeout: '{method}' not answered within {after:?}")
            }
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Serde(msg) => write!(f, "serde: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(err.to_string())
    }
}
