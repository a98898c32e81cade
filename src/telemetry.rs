//! Tracing subscriber setup for binaries embedding the client.
//!
//! The library itself only emits `tracing` events; it never installs a
//! subscriber. Binaries call [`init_tracing`] once at startup.

use clap::ValueEnum;
use serde::Deserialize;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::{Result, RpcError};

/// Log output format.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Install a global `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence; `default_directive` (for example `"info"` or
/// `"agent_rpc=debug"`) applies when it is unset or invalid.
///
/// # Errors
///
/// Returns `RpcError::Config` if a global subscriber is already installed.
pub fn init_tracing(log_format: LogFormat, default_directive: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| RpcError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| RpcError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
