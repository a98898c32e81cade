//! Outbound writer task.
//!
//! Every outbound JSON message flows through one tokio [`mpsc`] channel into
//! a single task that owns the write half of the stream. That task is the
//! only writer, so frames never interleave regardless of how many callers
//! send concurrently. Each queued frame carries a `oneshot` acknowledgement
//! so the sender learns whether its bytes reached the stream.
//!
//! The task exits cleanly when:
//! - `cancel` is triggered (graceful shutdown: the sink is flushed and closed,
//!   which closes the agent's stdin), or
//! - every [`FrameWriter`] handle is dropped.

use std::time::Duration;

use futures_util::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::codec::{FrameCodec, Framing};
use crate::{Result, RpcError};

/// Capacity of the outbound queue.
const OUTBOUND_QUEUE: usize = 256;

/// Upper bound on flushing and closing the stream at shutdown.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// One serialised frame waiting to be written.
#[derive(Debug)]
struct Outbound {
    payload: String,
    ack: oneshot::Sender<Result<()>>,
}

/// Cloneable handle for queueing outbound frames.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<Outbound>,
}

impl FrameWriter {
    /// Spawn the writer task over `writer`.
    ///
    /// Returns the handle used to queue frames and the task's [`JoinHandle`];
    /// the task resolves to `Err` when a write fails.
    pub fn spawn<W>(
        client_id: String,
        writer: W,
        framing: Framing,
        max_bytes: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let sink = FramedWrite::new(writer, FrameCodec::new(framing, max_bytes));
        let handle = tokio::spawn(run_writer(client_id, sink, rx, cancel));
        (Self { tx }, handle)
    }

    /// Serialise `message` and wait until it has been written.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Serde`] if `message` cannot be serialised.
    /// - [`RpcError::Transport`]`("writer closed")` if the writer task has stopped.
    /// - [`RpcError::Transport`]`("write failed: …")` if the stream write fails.
    /// - [`RpcError::NotRunning`] if the writer is cancelled before the frame
    ///   is fully written.
    pub async fn send(&self, message: &Value) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let (ack, done) = oneshot::channel();

        self.tx
            .send(Outbound { payload, ack })
            .await
            .map_err(|_| RpcError::Transport("writer closed".into()))?;

        done.await
            .map_err(|_| RpcError::Transport("writer stopped before the frame was written".into()))?
    }

    /// Whether the writer task has stopped accepting frames.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writer task body.
///
/// # Errors
///
/// Returns [`RpcError::Transport`]`("write failed: …")` after acknowledging
/// the failed frame; the stream is unusable from then on.
async fn run_writer<W>(
    client_id: String,
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(client_id, "writer: cancellation received, closing stream");
                break;
            }

            msg = rx.recv() => {
                let Some(Outbound { payload, ack }) = msg else {
                    debug!(client_id, "writer: all handles dropped, closing stream");
                    break;
                };

                // A peer that stops reading stalls the write; cancellation still wins.
                let written = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    result = sink.send(payload) => Some(result),
                };

                match written {
                    None => {
                        debug!(client_id, "writer: cancelled during write, abandoning frame");
                        let _ = ack.send(Err(stopped()));
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(client_id, error = %err, "writer: write failed");
                        let failure = RpcError::Transport(format!("write failed: {err}"));
                        let _ = ack.send(Err(failure.clone()));
                        rx.close();
                        fail_queued(&mut rx, &failure);
                        return Err(failure);
                    }
                    // The sender may have given up waiting; the frame is on the wire either way.
                    Some(Ok(())) => {
                        let _ = ack.send(Ok(()));
                    }
                }
            }
        }
    }

    rx.close();
    let closing = if cancel.is_cancelled() {
        stopped()
    } else {
        RpcError::Transport("writer closed".into())
    };
    fail_queued(&mut rx, &closing);

    match tokio::time::timeout(CLOSE_WAIT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(client_id, error = %err, "writer: close failed"),
        Err(_) => debug!(client_id, "writer: peer not reading, dropping stream unflushed"),
    }
    Ok(())
}

fn stopped() -> RpcError {
    RpcError::NotRunning("client stopped".into())
}

/// Reject frames still sitting in the queue after the writer stops.
fn fail_queued(rx: &mut mpsc::Receiver<Outbound>, error: &RpcError) {
    while let Ok(Outbound { ack, .. }) = rx.try_recv() {
        let _ = ack.send(Err(error.clone()));
    }
}
