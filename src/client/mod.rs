//! RPC client facade.
//!
//! [`RpcClient`] owns one connection to one agent and exposes the generic
//! primitives higher-level method wrappers build on:
//!
//! - [`RpcClient::request`] / [`RpcClient::call`]: correlated request/response.
//! - [`RpcClient::notify`]: fire-and-forget.
//! - [`RpcClient::subscribe`]: ordered notification delivery.
//! - [`RpcClient::on_request`]: answer requests initiated by the agent.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!      │                   │            │
//!      │                   └───────┬────┘ unexpected exit / stream loss
//!      │                           ▼
//!      └──────stop/force_stop──▶ Failed / Stopped (terminal)
//! ```
//!
//! `Stopped` and `Failed` are terminal; build a new client to reconnect.

mod connection;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::process::AgentProcess;
use crate::protocol::{notification_frame, request_frame, RequestId};
use crate::rpc::{
    request_handler, CorrelationTable, EventBroadcaster, HandlerResult, Notification,
    RequestHandlers, SubscriptionId,
};
use crate::transport::TransportStreams;
use crate::{Result, RpcError};

use connection::Connection;

/// Method used for liveness and protocol version checks.
pub const PING_METHOD: &str = "ping";

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, `start` not yet called.
    NotStarted,
    /// Connecting or spawning.
    Starting,
    /// Requests may be issued.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Shut down on request.
    Stopped,
    /// The connection or process failed.
    Failed,
}

impl ConnectionState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared client state. Background tasks only hold a `Weak` to it.
#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) client_id: String,
    pub(crate) config: ClientConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) table: Arc<CorrelationTable>,
    pub(crate) events: Arc<EventBroadcaster>,
    pub(crate) handlers: Arc<RequestHandlers>,
    pub(crate) shutdown: CancellationToken,
    connection: Mutex<Option<Arc<Connection>>>,
    last_error: Mutex<Option<String>>,
}

impl ClientInner {
    fn connection(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from any state in `from` to `to`; returns whether it happened.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(client_id = self.client_id, state = %to, "state changed");
        }
        changed
    }

    fn record_error(&self, message: &str) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_owned());
    }

    /// Reject waiters with `reason` and release the connection.
    fn abort_connection(&self, reason: &RpcError) {
        self.table.close(reason);
        if let Some(conn) = self.connection().take() {
            conn.abort();
        }
    }

    /// Handle an unexpected end of `conn`. Ignored unless the client was
    /// starting or running.
    pub(crate) fn connection_lost(&self, conn: &Connection, reason: &str) {
        if !self.transition(
            &[ConnectionState::Starting, ConnectionState::Running],
            ConnectionState::Failed,
        ) {
            debug!(client_id = self.client_id, reason, "connection ended during shutdown");
            return;
        }

        let message = format!("connection lost: {reason}{}", conn.stderr_context());
        warn!(client_id = self.client_id, reason, "connection lost, client failed");
        self.record_error(&message);
        self.abort_connection(&RpcError::Transport(message));
        conn.abort();
        self.events.close();
    }

    fn force_stop(&self) {
        let _ = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ConnectionState::Stopped;
                true
            }
        });
        self.shutdown.cancel();
        self.abort_connection(&RpcError::NotRunning("client force-stopped".into()));
        self.events.close();
    }

    /// Register, send and await one request on `conn`.
    async fn send_request(
        &self,
        conn: &Connection,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (id, slot) = self.table.register(method)?;
        let _guard = PendingGuard {
            table: &self.table,
            id,
        };

        debug!(client_id = self.client_id, id, method, "sending request");
        let frame = request_frame(&RequestId::Number(id), method, &params);
        // One deadline covers both the write and the wait for the answer.
        let exchange = async {
            conn.writer.send(&frame).await?;
            match slot.await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Transport("connection closed".into())),
            }
        };

        match timeout {
            Some(after) => {
                if let Ok(outcome) = tokio::time::timeout(after, exchange).await {
                    outcome
                } else {
                    self.table.cancel(id);
                    debug!(client_id = self.client_id, id, method, ?after, "request timed out");
                    Err(RpcError::Timeout {
                        method: method.to_owned(),
                        after,
                    })
                }
            }
            None => exchange.await,
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.abort_connection(&RpcError::NotRunning("client dropped".into()));
    }
}

/// Removes a pending call once its caller stops waiting, including when the
/// awaiting future is dropped early. A no-op after resolution.
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// JSON-RPC client for one agent connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Build a client; nothing is spawned or connected until [`RpcClient::start`].
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` if `config` fails validation.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client_id = uuid::Uuid::new_v4().to_string();
        let (state, _) = watch::channel(ConnectionState::NotStarted);

        Ok(Self {
            inner: Arc::new(ClientInner {
                events: Arc::new(EventBroadcaster::new(client_id.clone())),
                client_id,
                config,
                state,
                table: Arc::new(CorrelationTable::new()),
                handlers: Arc::new(RequestHandlers::default()),
                shutdown: CancellationToken::new(),
                connection: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        })
    }

    /// Unique id of this client, attached to every log line it emits.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Configuration the client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Description of the failure that moved the client to `Failed`.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.table.len()
    }

    /// OS process id of the spawned agent, if any.
    #[must_use]
    pub fn agent_pid(&self) -> Option<u32> {
        self.inner
            .connection()
            .as_ref()
            .and_then(|conn| conn.process.as_ref())
            .and_then(AgentProcess::pid)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Spawn or connect to the agent described by the configuration.
    ///
    /// Calling `start` on a running client is a no-op.
    ///
    /// # Errors
    ///
    /// - `RpcError::Launch` if the agent cannot be spawned or fails the
    ///   protocol version check.
    /// - `RpcError::Transport` if the socket connection fails.
    /// - `RpcError::NotRunning` if the client is starting, stopped or failed.
    ///
    /// On error the client is left `Failed`.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        self.start_with(|| connection::connect(&inner.config, &inner.client_id))
            .await
    }

    /// Start over caller-supplied streams instead of the configured transport.
    ///
    /// `reader` carries agent → client frames, `writer` client → agent frames.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::start`], minus launch failures.
    pub async fn start_with_streams<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let streams = TransportStreams::new(reader, writer);
        self.start_with(|| async move { Ok((None, streams)) }).await
    }

    async fn start_with<F, Fut>(&self, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Option<AgentProcess>, TransportStreams)>>,
    {
        let inner = &self.inner;
        if !inner.transition(&[ConnectionState::NotStarted], ConnectionState::Starting) {
            return match self.state() {
                ConnectionState::Running => Ok(()),
                ConnectionState::Starting => {
                    Err(RpcError::NotRunning("client is already starting".into()))
                }
                other => Err(RpcError::NotRunning(format!(
                    "client cannot be restarted (state: {other})"
                ))),
            };
        }
        info!(client_id = inner.client_id, "starting client");

        let established = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => {
                Err(RpcError::Cancelled("start interrupted by force_stop".into()))
            }
            result = self.establish(open) => result,
        };

        if let Err(e) = established {
            warn!(client_id = inner.client_id, error = %e, "client failed to start");
            if inner.transition(&[ConnectionState::Starting], ConnectionState::Failed) {
                inner.record_error(&e.to_string());
                inner.events.close();
            }
            inner.abort_connection(&RpcError::NotRunning(format!("client failed to start: {e}")));
            return Err(e);
        }

        if inner.transition(&[ConnectionState::Starting], ConnectionState::Running) {
            info!(client_id = inner.client_id, pid = self.agent_pid(), "client running");
            Ok(())
        } else {
            let state = self.state();
            inner.abort_connection(&RpcError::NotRunning("client stopped during start".into()));
            Err(RpcError::NotRunning(format!(
                "client did not reach running (state: {state})"
            )))
        }
    }

    async fn establish<F, Fut>(&self, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Option<AgentProcess>, TransportStreams)>>,
    {
        let (process, streams) = open().await?;
        let conn = Connection::open(&self.inner, process, streams);
        *self.inner.connection() = Some(Arc::clone(&conn));

        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::Cancelled("start interrupted by force_stop".into()));
        }

        if let Some(expected) = self.inner.config.expected_protocol_version {
            self.verify_protocol_version(&conn, expected).await?;
        }
        Ok(())
    }

    async fn verify_protocol_version(&self, conn: &Connection, expected: u32) -> Result<()> {
        let timeout = self.inner.config.timeouts.startup_timeout();
        let result = self
            .inner
            .send_request(conn, PING_METHOD, json!({}), Some(timeout))
            .await
            .map_err(|e| {
                RpcError::Launch(format!("protocol version check failed: {e}{}", conn.stderr_context()))
            })?;

        match result.get("protocolVersion").and_then(Value::as_u64) {
            Some(actual) if actual == u64::from(expected) => {
                debug!(client_id = self.inner.client_id, actual, "protocol version verified");
                Ok(())
            }
            Some(actual) => Err(RpcError::Launch(format!(
                "protocol version mismatch: expected {expected}, agent reports {actual}"
            ))),
            None => Err(RpcError::Launch(format!(
                "agent does not report a protocol version; expected {expected}"
            ))),
        }
    }

    /// Gracefully shut down: reject outstanding calls, close the agent's
    /// input, wait for it to exit within the configured grace period and
    /// release every resource.
    ///
    /// Idempotent: calling `stop` on a stopped, failed or never-started client
    /// returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the agent survives the kill that
    /// follows the grace period. The client is `Stopped` regardless.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        loop {
            match self.state() {
                ConnectionState::Stopped | ConnectionState::Failed => return Ok(()),
                ConnectionState::NotStarted => {
                    if inner.transition(&[ConnectionState::NotStarted], ConnectionState::Stopped) {
                        inner.shutdown.cancel();
                        inner.events.close();
                        return Ok(());
                    }
                }
                ConnectionState::Starting => {
                    self.force_stop();
                    return Ok(());
                }
                ConnectionState::Stopping => {
                    let mut changes = self.state_changes();
                    let _ = changes.wait_for(|s| s.is_terminal()).await;
                    return Ok(());
                }
                ConnectionState::Running => {
                    if inner.transition(&[ConnectionState::Running], ConnectionState::Stopping) {
                        break;
                    }
                }
            }
        }

        info!(client_id = inner.client_id, "stopping client");
        inner.table.close(&RpcError::NotRunning("client stopped".into()));

        let conn = inner.connection().clone();
        let mut outcome = Ok(());
        if let Some(conn) = conn {
            conn.writer_cancel.cancel();
            if let Some(process) = &conn.process {
                match process.stop(inner.config.timeouts.shutdown_grace()).await {
                    Ok(exit) => debug!(client_id = inner.client_id, reason = exit.reason, "agent stopped"),
                    Err(e) => {
                        warn!(client_id = inner.client_id, error = %e, "agent did not stop cleanly");
                        outcome = Err(e);
                    }
                }
            }
            conn.abort();
        }

        inner.connection().take();
        inner.shutdown.cancel();
        inner.events.close();
        inner.transition(&[ConnectionState::Stopping], ConnectionState::Stopped);
        info!(client_id = inner.client_id, "client stopped");
        outcome
    }

    /// Terminate immediately without waiting.
    ///
    /// Callable from any state, any number of times, concurrently with
    /// `start` or `stop`. Outstanding calls fail with `RpcError::NotRunning`.
    pub fn force_stop(&self) {
        debug!(client_id = self.inner.client_id, "force stop");
        self.inner.force_stop();
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    fn running_connection(&self) -> Result<Arc<Connection>> {
        let state = self.state();
        if state != ConnectionState::Running {
            return Err(RpcError::NotRunning(format!(
                "client is not running (state: {state})"
            )));
        }
        self.inner
            .connection()
            .clone()
            .ok_or_else(|| RpcError::NotRunning("client has no connection".into()))
    }

    /// Send a request and await its result, using the configured default
    /// timeout (none when `timeouts.request_ms` is 0).
    ///
    /// # Errors
    ///
    /// - `RpcError::NotRunning` if the client is not running.
    /// - `RpcError::Protocol` if the agent answers with an error object.
    /// - `RpcError::Timeout` if the deadline elapses.
    /// - `RpcError::Transport` if the connection is lost first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let timeout = self.inner.config.timeouts.request_timeout();
        self.request_with_timeout(method, params, timeout).await
    }

    /// [`RpcClient::request`] with an explicit deadline.
    ///
    /// A timed-out call is abandoned locally; the agent is not told and a late
    /// response is discarded.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::request`].
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let conn = self.running_connection()?;
        self.inner.send_request(&conn, method, params, timeout).await
    }

    /// Typed request: serialise `params` and deserialise the result as `R`.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::request`], plus `RpcError::Serde` if either
    /// conversion fails.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a notification. Resolves once the frame has been written.
    ///
    /// # Errors
    ///
    /// - `RpcError::NotRunning` if the client is not running.
    /// - `RpcError::Transport` if the write fails; the connection then fails
    ///   as well.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let conn = self.running_connection()?;
        debug!(client_id = self.inner.client_id, method, "sending notification");
        conn.writer.send(&notification_frame(method, &params)).await
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Receive every notification, in arrival order, on a dedicated task.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotRunning` outside a tokio runtime.
    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(None, Arc::new(handler))
    }

    /// Receive only notifications whose method equals `method`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotRunning` outside a tokio runtime.
    pub fn subscribe_method<F>(&self, method: impl Into<String>, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe(Some(method.into()), Arc::new(handler))
    }

    /// Stop delivering to `id`. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Answer agent-initiated requests for `method` with `handler`.
    ///
    /// Replaces any handler already registered for the method.
    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.handlers.insert(method, request_handler(handler));
    }

    /// Remove the handler for `method`; later requests get "method not found".
    pub fn remove_request_handler(&self, method: &str) -> bool {
        self.inner.handlers.remove(method).is_some()
    }

    /// Round-trip a `ping` request.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::request`].
    pub async fn ping(&self, message: &str) -> Result<Value> {
        self.request(PING_METHOD, json!({ "message": message })).await
    }
}
