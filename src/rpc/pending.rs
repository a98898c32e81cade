//! Correlation table for outstanding requests.
//!
//! Each outbound request registers a [`PendingCall`] keyed by a freshly
//! allocated numeric id. The dispatch loop completes entries as responses
//! arrive; callers cancel their own entry on timeout. Every entry resolves
//! exactly once: completion removes it from the map, so any later attempt
//! finds nothing and becomes a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Result, RpcError};

/// Receiver half a caller awaits for its response.
pub type ResponseSlot = oneshot::Receiver<Result<Value>>;

/// Local bookkeeping for one in-flight request.
#[derive(Debug)]
struct PendingCall {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<u64, PendingCall>,
    /// Set once the connection is gone; new registrations fail with it.
    closed: Option<RpcError>,
}

/// Thread-safe map of request id to waiting caller.
#[derive(Debug)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    /// Empty table; the first id handed out is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and a slot to await its outcome.
    ///
    /// # Errors
    ///
    /// Returns the close reason if [`CorrelationTable::close`] has been called.
    pub fn register(&self, method: &str) -> Result<(u64, ResponseSlot)> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(reason.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(
            id,
            PendingCall {
                method: method.to_owned(),
                created_at: Instant::now(),
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Deliver `outcome` to the waiter registered under `id`.
    ///
    /// Returns `false` when no such entry exists: it already resolved, timed
    /// out, was cancelled, or the id was never issued.
    pub fn complete(&self, id: u64, outcome: Result<Value>) -> bool {
        let Some(call) = self.lock().calls.remove(&id) else {
            debug!(id, "response for unknown or abandoned request id discarded");
            return false;
        };

        debug!(
            id,
            method = call.method,
            elapsed_ms = elapsed_ms(call.created_at.elapsed()),
            ok = outcome.is_ok(),
            "request completed"
        );
        // The caller may have stopped waiting; that is not an error here.
        let _ = call.tx.send(outcome);
        true
    }

    /// Complete `id` successfully.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Complete `id` with an error.
    pub fn reject(&self, id: u64, error: RpcError) -> bool {
        self.complete(id, Err(error))
    }

    /// Abandon `id` locally and fail its waiter with
    /// [`RpcError::Cancelled`]. The request already on the wire is not
    /// retracted; a late response is discarded.
    pub fn cancel(&self, id: u64) -> bool {
        let Some(call) = self.lock().calls.remove(&id) else {
            return false;
        };
        debug!(id, method = call.method, "request cancelled locally");
        let _ = call.tx.send(Err(RpcError::Cancelled(format!(
            "request {id} ('{}') cancelled",
            call.method
        ))));
        true
    }

    /// Drop `id` without notifying anyone. Used when the caller itself went
    /// away.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Reject every pending call with `reason` and refuse new registrations.
    ///
    /// Returns the number of calls rejected. Only the first close reason is
    /// kept.
    pub fn close(&self, reason: &RpcError) -> usize {
        let drained: Vec<(u64, PendingCall)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.calls.drain().collect()
        };

        let count = drained.len();
        if count > 0 {
            warn!(count, %reason, "rejecting pending requests");
        }
        for (_, call) in drained {
            let _ = call.tx.send(Err(reason.clone()));
        }
        count
    }

    /// Whether [`CorrelationTable::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    /// Whether no calls are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
