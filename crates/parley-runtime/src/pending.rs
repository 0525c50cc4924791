use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use parley_schema::jsonrpc::{JsonRpcResponse, RequestId};
use tokio::sync::oneshot;
use tracing::warn;

/// Pending-response bookkeeping shared by the client and server sessions:
/// id generation plus the map of one-shot waiters keyed by request id.
///
/// Ids are `"{prefix}-{counter}"`; the prefix is unique to the session and
/// the counter only ever grows, so no id is reused for the session lifetime.
pub(crate) struct RequestTracker {
    prefix: String,
    counter: AtomicU64,
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
}

impl RequestTracker {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh id and register its waiter.
    pub(crate) fn register(&self) -> (RequestId, oneshot::Receiver<JsonRpcResponse>) {
        let id = RequestId::String(format!(
            "{}-{}",
            self.prefix,
            self.counter.fetch_add(1, Ordering::Relaxed)
        ));
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter map poisoned")
            .insert(id.clone(), tx);
        (id, rx)
    }

    /// Drop the waiter for `id`, e.g. after a timeout or a failed send. A
    /// response arriving later will find nothing and be dropped.
    pub(crate) fn remove(&self, id: &RequestId) {
        self.waiters.lock().expect("waiter map poisoned").remove(id);
    }

    /// Route an inbound response to its waiter. Unknown ids (already timed
    /// out, or never ours) are logged and dropped.
    pub(crate) fn complete(&self, response: JsonRpcResponse) {
        let waiter = self
            .waiters
            .lock()
            .expect("waiter map poisoned")
            .remove(&response.id);
        match waiter {
            Some(tx) => {
                // The requester may have given up between lookup and delivery.
                let _ = tx.send(response);
            }
            None => warn!(id = %response.id, "dropping response for unknown request id"),
        }
    }

    /// Fail every pending waiter; used when the session closes. Dropping the
    /// senders wakes each waiter with a closed-channel error.
    pub(crate) fn fail_all(&self) {
        self.waiters.lock().expect("waiter map poisoned").clear();
    }

    pub(crate) fn pending(&self) -> usize {
        self.waiters.lock().expect("waiter map poisoned").len()
    }
}
