//! Client configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::transport::codec::{Framing, MAX_FRAME_BYTES};
use crate::{Result, RpcError};

/// Agent process to launch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed before any transport-specific flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherits the caller's when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Pass the caller's whole environment through. When `false` only the
    /// allowlist in [`crate::process::ALLOWED_ENV_VARS`] survives.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Extra variables set on the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentConfig {
    /// Agent running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            inherit_env: true,
            env: BTreeMap::new(),
        }
    }

    /// Replace the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// How the client reaches the agent.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawned agent's stdin/stdout.
    #[default]
    Stdio,
    /// TCP socket: an external server when `url` is set, otherwise a spawned
    /// agent that announces its port.
    Tcp {
        /// External server address (`port`, `host:port` or `http(s)://host:port`).
        #[serde(default)]
        url: Option<String>,
        /// Port requested from a spawned agent; `0` lets it choose.
        #[serde(default)]
        port: u16,
        /// Host a spawned agent listens on.
        #[serde(default = "default_tcp_host")]
        host: String,
    },
    /// Existing local socket server (Unix domain socket or named pipe).
    LocalSocket {
        /// Socket path or namespaced name.
        name: String,
    },
}

/// Deadlines applied by the client.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Default per-request timeout; 0 means requests wait indefinitely.
    #[serde(default)]
    pub request_ms: u64,
    /// Time allowed for a spawned TCP agent to announce its port.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Time `stop()` waits for the agent to exit before killing it.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 0,
            startup_seconds: default_startup_seconds(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Default request timeout, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_ms > 0).then(|| Duration::from_millis(self.request_ms))
    }

    /// Startup window for spawned TCP agents.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_seconds)
    }

    /// Grace period before a graceful stop escalates to a kill.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_tcp_host() -> String {
    "127.0.0.1".into()
}

fn default_startup_seconds() -> u64 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}

/// Top-level client configuration parsed from TOML or built in code.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Wire framing.
    #[serde(default)]
    pub framing: Framing,
    /// Largest accepted inbound frame.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Protocol version the agent must report from `ping` during start.
    #[serde(default)]
    pub expected_protocol_version: Option<u32>,
    /// Agent process; absent when connecting to an existing server.
    #[serde(default)]
    pub agent: Option<AgentConfig>,
    /// Transport selection.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Client deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl ClientConfig {
    /// Spawn `agent` and talk over its stdio.
    #[must_use]
    pub fn stdio(agent: AgentConfig) -> Self {
        Self::with_transport(Some(agent), TransportConfig::Stdio)
    }

    /// Connect to an external TCP server at `url`.
    pub fn tcp(url: impl Into<String>) -> Self {
        Self::with_transport(
            None,
            TransportConfig::Tcp {
                url: Some(url.into()),
                port: 0,
                host: default_tcp_host(),
            },
        )
    }

    /// Spawn `agent` with `--port <port>` and connect once it announces itself.
    #[must_use]
    pub fn spawned_tcp(agent: AgentConfig, port: u16) -> Self {
        Self::with_transport(
            Some(agent),
            TransportConfig::Tcp {
                url: None,
                port,
                host: default_tcp_host(),
            },
        )
    }

    /// Connect to an existing local socket server.
    pub fn local_socket(name: impl Into<String>) -> Self {
        Self::with_transport(None, TransportConfig::LocalSocket { name: name.into() })
    }

    /// Configuration for caller-supplied streams
    /// ([`crate::RpcClient::start_with_streams`]).
    #[must_use]
    pub fn streams() -> Self {
        Self::with_transport(None, TransportConfig::Stdio)
    }

    fn with_transport(agent: Option<AgentConfig>, transport: TransportConfig) -> Self {
        Self {
            framing: Framing::default(),
            max_frame_bytes: MAX_FRAME_BYTES,
            expected_protocol_version: None,
            agent,
            transport,
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| RpcError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check option combinations that cannot work together.
    ///
    /// Stdio without an `[agent]` section is accepted here because it is also
    /// the shape used for caller-supplied streams; `RpcClient::start` rejects
    /// it when a process would be needed.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 {
            return Err(RpcError::Config(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }

        if let Some(agent) = &self.agent {
            if agent.program.trim().is_empty() {
                return Err(RpcError::Config("agent.program must not be empty".into()));
            }
        }

        match &self.transport {
            TransportConfig::Stdio => {}
            TransportConfig::Tcp { url: Some(url), .. } => {
                if self.agent.is_some() {
                    return Err(RpcError::Config(
                        "transport.url connects to an external server and cannot be combined with [agent]"
                            .into(),
                    ));
                }
                parse_server_url(url)?;
            }
            TransportConfig::Tcp { url: None, .. } => {
                if self.agent.is_none() {
                    return Err(RpcError::Config(
                        "tcp transport without url requires an [agent] to spawn".into(),
                    ));
                }
            }
            TransportConfig::LocalSocket { name } => {
                if self.agent.is_some() {
                    return Err(RpcError::Config(
                        "local_socket connects to an existing server and cannot be combined with [agent]"
                            .into(),
                    ));
                }
                if name.trim().is_empty() {
                    return Err(RpcError::Config(
                        "transport.name must not be empty".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Split an external server address into host and port.
///
/// Accepts `port`, `host:port`, `http://host:port` and `https://host:port`.
/// An empty host (`":3000"`) means `localhost`.
///
/// # Errors
///
/// Returns `RpcError::Config` for any other shape or a port outside `1..=65535`.
pub fn parse_server_url(url: &str) -> Result<(String, u16)> {
    let clean = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);

    if !clean.is_empty() && clean.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(("localhost".into(), parse_port(clean, url)?));
    }

    let mut parts = clean.split(':');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(RpcError::Config(format!(
            "invalid server url '{url}': expected \"host:port\", \"http://host:port\" or \"port\""
        )));
    };

    let host = if host.is_empty() { "localhost" } else { host };
    Ok((host.to_owned(), parse_port(port, url)?))
}

fn parse_port(raw: &str, url: &str) -> Result<u16> {
    raw.parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| RpcError::Config(format!("invalid port in server url '{url}'")))
}
