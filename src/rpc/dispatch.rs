//! Dispatch loop: the single reader of the inbound stream.
//!
//! Frames are decoded by [`FramedRead`] over a [`FrameCodec`] and processed
//! strictly in arrival order:
//!
//! | Message        | Routed to                                         |
//! |----------------|---------------------------------------------------|
//! | Response       | [`CorrelationTable::complete`]                    |
//! | Notification   | [`EventBroadcaster::deliver`] (never blocks)      |
//! | Request        | registered handler on its own task, answered via the writer |
//! | *(malformed)*  | Skipped; logged at `WARN`                          |
//!
//! When the loop ends for any reason other than cancellation, every
//! outstanding call is rejected so no caller waits past the connection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{response_frame, ErrorObject, Message, RequestId};
use crate::rpc::events::{EventBroadcaster, Notification};
use crate::rpc::handlers::RequestHandlers;
use crate::rpc::pending::CorrelationTable;
use crate::transport::codec::{Frame, FrameCodec, Framing};
use crate::transport::writer::FrameWriter;
use crate::RpcError;

/// Shared state the dispatch loop routes into.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Owning client, for log correlation.
    pub client_id: String,
    /// Outstanding requests.
    pub table: Arc<CorrelationTable>,
    /// Notification subscribers.
    pub events: Arc<EventBroadcaster>,
    /// Handlers for agent-initiated requests.
    pub handlers: Arc<RequestHandlers>,
    /// Writer used to answer agent-initiated requests.
    pub writer: FrameWriter,
}

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchExit {
    /// The agent closed its output stream.
    EndOfStream,
    /// Reading the stream failed.
    Failed(String),
    /// The connection was cancelled locally.
    Cancelled,
}

impl DispatchExit {
    /// Short description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::EndOfStream => "stream closed".to_owned(),
            Self::Failed(reason) => format!("stream error: {reason}"),
            Self::Cancelled => "cancelled".to_owned(),
        }
    }
}

/// Run the dispatch loop until end-of-stream, a read error or `cancel`.
pub async fn run_dispatch<R>(
    ctx: DispatchContext,
    reader: R,
    framing: Framing,
    max_bytes: usize,
    cancel: CancellationToken,
) -> DispatchExit
where
    R: AsyncRead + Unpin + Send,
{
    let client_id = ctx.client_id.as_str();
    let mut framed = FramedRead::new(reader, FrameCodec::new(framing, max_bytes));

    let exit = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(client_id, "dispatch: cancellation received, stopping");
                break DispatchExit::Cancelled;
            }

            item = framed.next() => match item {
                None => {
                    debug!(client_id, "dispatch: end of stream");
                    break DispatchExit::EndOfStream;
                }

                Some(Err(e)) => {
                    warn!(client_id, error = %e, "dispatch: read error, stopping");
                    break DispatchExit::Failed(e.to_string());
                }

                Some(Ok(Frame::Rejected(reason))) => {
                    warn!(client_id, reason, "dispatch: frame rejected, skipping");
                }

                Some(Ok(Frame::Message(text))) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    match Message::parse(&text) {
                        Ok(message) => route(&ctx, message),
                        Err(e) => {
                            warn!(client_id, error = %e, raw = %text, "dispatch: undecodable message, skipping");
                        }
                    }
                }
            }
        }
    };

    if exit != DispatchExit::Cancelled {
        let reason = RpcError::Transport(format!("connection closed: {}", exit.describe()));
        ctx.table.close(&reason);
    }
    exit
}

/// Route one decoded message. Never awaits.
fn route(ctx: &DispatchContext, message: Message) {
    let client_id = ctx.client_id.as_str();
    match message {
        Message::Response { id, outcome } => {
            let Some(numeric) = id.as_u64() else {
                warn!(client_id, %id, "dispatch: response with non-numeric id discarded");
                return;
            };
            let outcome = outcome.map_err(RpcError::Protocol);
            if !ctx.table.complete(numeric, outcome) {
                warn!(client_id, id = numeric, "dispatch: response for unknown request id");
            }
        }

        Message::Notification { method, params } => {
            let delivered = ctx.events.deliver(Notification {
                method: method.clone(),
                params,
            });
            debug!(client_id, method, delivered, "dispatch: notification");
        }

        Message::Request { id, method, params } => {
            debug!(client_id, %id, method, "dispatch: inbound request");
            spawn_request_handler(ctx, id, method, params);
        }
    }
}

/// Answer an agent-initiated request on its own task.
fn spawn_request_handler(ctx: &DispatchContext, id: RequestId, method: String, params: Value) {
    let client_id = ctx.client_id.clone();
    let handler = ctx.handlers.get(&method);
    let writer = ctx.writer.clone();

    tokio::spawn(async move {
        let outcome = match handler {
            None => {
                debug!(client_id, method, "dispatch: no handler registered");
                Err(ErrorObject::method_not_found(&method))
            }
            Some(handler) => {
                let call = AssertUnwindSafe(async move { handler(params).await });
                if let Ok(outcome) = call.catch_unwind().await {
                    outcome
                } else {
                    warn!(client_id, method, "dispatch: request handler panicked");
                    Err(ErrorObject::internal(format!("handler for '{method}' panicked")))
                }
            }
        };

        if let Err(e) = writer.send(&response_frame(&id, &outcome)).await {
            debug!(client_id, %id, error = %e, "dispatch: could not send response");
        }
    });
}
