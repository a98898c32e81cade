//! Connection runtime: endpoint setup, background tasks and failure watch.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ClientInner;
use crate::config::{parse_server_url, ClientConfig, TransportConfig};
use crate::process::{await_port_announcement, spawn_agent, AgentProcess, SpawnConfig};
use crate::rpc::{run_dispatch, DispatchContext, DispatchExit};
use crate::transport::{connect_local_socket, connect_tcp, FrameWriter, TransportStreams};
use crate::{Result, RpcError};

/// How long the watcher waits for an exit status after the stream closes.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(250);

/// One live connection: writer handle, cancellation and the agent process.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) writer: FrameWriter,
    /// Stops only the writer; closing the agent's stdin.
    pub(crate) writer_cancel: CancellationToken,
    /// Stops every task of this connection.
    pub(crate) cancel: CancellationToken,
    pub(crate) process: Option<AgentProcess>,
}

impl Connection {
    /// Spawn the writer, dispatch and watcher tasks over `streams`.
    pub(crate) fn open(
        inner: &Arc<ClientInner>,
        process: Option<AgentProcess>,
        streams: TransportStreams,
    ) -> Arc<Self> {
        let config = &inner.config;
        let cancel = inner.shutdown.child_token();
        let writer_cancel = cancel.child_token();

        let (writer, writer_task) = FrameWriter::spawn(
            inner.client_id.clone(),
            streams.writer,
            config.framing,
            config.max_frame_bytes,
            writer_cancel.clone(),
        );

        let ctx = DispatchContext {
            client_id: inner.client_id.clone(),
            table: Arc::clone(&inner.table),
            events: Arc::clone(&inner.events),
            handlers: Arc::clone(&inner.handlers),
            writer: writer.clone(),
        };
        let dispatch_task = tokio::spawn(run_dispatch(
            ctx,
            streams.reader,
            config.framing,
            config.max_frame_bytes,
            cancel.clone(),
        ));

        let conn = Arc::new(Self {
            writer,
            writer_cancel,
            cancel,
            process,
        });

        tokio::spawn(watch_connection(
            Arc::downgrade(inner),
            Arc::clone(&conn),
            dispatch_task,
            writer_task,
        ));
        conn
    }

    /// Tear everything down immediately.
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
        if let Some(process) = &self.process {
            process.force_stop();
        }
    }

    /// Stderr tail of the agent, formatted for an error message.
    pub(crate) fn stderr_context(&self) -> String {
        self.process
            .as_ref()
            .map(AgentProcess::stderr_tail)
            .filter(|lines| !lines.is_empty())
            .map_or_else(String::new, |lines| {
                format!("; agent stderr:\n{}", lines.join("\n"))
            })
    }
}

/// Open the transport described by `config`, spawning the agent when needed.
///
/// # Errors
///
/// - `RpcError::Config` if the transport needs an `[agent]` that is missing.
/// - `RpcError::Launch` if the agent cannot be spawned or never announces
///   its port.
/// - `RpcError::Transport` if a socket connection fails.
pub(crate) async fn connect(
    config: &ClientConfig,
    client_id: &str,
) -> Result<(Option<AgentProcess>, TransportStreams)> {
    match &config.transport {
        TransportConfig::Stdio => {
            let agent = config.agent.as_ref().ok_or_else(|| {
                RpcError::Config("stdio transport requires an [agent] to spawn".into())
            })?;
            let (process, stdio) = spawn_agent(&SpawnConfig::stdio(agent), client_id)?;
            let stdin = stdio
                .stdin
                .ok_or_else(|| RpcError::Launch("agent stdin is not piped".into()))?;
            Ok((Some(process), TransportStreams::new(stdio.stdout, stdin)))
        }

        TransportConfig::Tcp { url: Some(url), .. } => {
            let (host, port) = parse_server_url(url)?;
            info!(client_id, host, port, "connecting to external tcp server");
            Ok((None, connect_tcp(&host, port).await?))
        }

        TransportConfig::Tcp {
            url: None,
            port,
            host,
        } => {
            let agent = config.agent.as_ref().ok_or_else(|| {
                RpcError::Config("tcp transport without url requires an [agent] to spawn".into())
            })?;
            let (process, stdio) = spawn_agent(&SpawnConfig::tcp(agent, *port), client_id)?;

            let announced =
                await_port_announcement(client_id, stdio.stdout, config.timeouts.startup_timeout())
                    .await;
            let streams = match announced {
                Ok(port) => connect_tcp(host, port).await,
                Err(e) => Err(e),
            };

            match streams {
                Ok(streams) => Ok((Some(process), streams)),
                Err(e) => {
                    process.force_stop();
                    let tail = process.stderr_tail();
                    if tail.is_empty() {
                        Err(e)
                    } else {
                        Err(RpcError::Launch(format!(
                            "{e}; agent stderr:\n{}",
                            tail.join("\n")
                        )))
                    }
                }
            }
        }

        TransportConfig::LocalSocket { name } => {
            info!(client_id, name, "connecting to local socket server");
            Ok((None, connect_local_socket(name).await?))
        }
    }
}

/// Watch one connection and report the first unexpected failure.
///
/// Returns quietly when the connection is cancelled locally.
async fn watch_connection(
    inner: Weak<ClientInner>,
    conn: Arc<Connection>,
    dispatch: JoinHandle<DispatchExit>,
    writer: JoinHandle<Result<()>>,
) {
    let process_exit = async {
        match &conn.process {
            Some(process) => process.wait_for_exit().await.reason,
            None => std::future::pending().await,
        }
    };

    let mut reason = tokio::select! {
        biased;

        () = conn.cancel.cancelled() => return,

        exit = dispatch => match exit {
            Ok(DispatchExit::Cancelled) => return,
            Ok(exit) => exit.describe(),
            Err(e) => format!("dispatch task failed: {e}"),
        },

        result = writer => match result {
            Ok(Ok(())) if conn.writer_cancel.is_cancelled() => return,
            Ok(Ok(())) => "writer closed".to_owned(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("writer task failed: {e}"),
        },

        exit = process_exit => format!("agent {exit}"),
    };

    if let Some(process) = &conn.process {
        if let Ok(exit) = tokio::time::timeout(EXIT_STATUS_WAIT, process.wait_for_exit()).await {
            if !reason.contains(&exit.reason) {
                reason = format!("{reason} (agent {})", exit.reason);
            }
        }
    }

    let Some(inner) = inner.upgrade() else {
        debug!(reason, "connection ended after client was dropped");
        conn.abort();
        return;
    };
    inner.connection_lost(&conn, &reason);
}
