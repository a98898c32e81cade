#![forbid(unsafe_code)]

//! JSON-RPC 2.0 client runtime for headless agent processes.
//!
//! Spawns (or connects to) an agent, frames JSON-RPC messages over its
//! stdio or a socket, correlates responses with requests and fans
//! notifications out to subscribers. Per-method API wrappers build on
//! [`RpcClient::request`], [`RpcClient::call`] and [`RpcClient::subscribe`].

pub mod client;
pub mod config;
pub mod errors;
pub mod process;
pub mod protocol;
pub mod rpc;
pub mod telemetry;
pub mod transport;

pub use client::{ConnectionState, RpcClient};
pub use config::{AgentConfig, ClientConfig, TimeoutConfig, TransportConfig};
pub use errors::{Result, RpcError};
pub use protocol::{ErrorObject, Message, RequestId};
pub use rpc::{Notification, SubscriptionId};
pub use transport::Framing;
