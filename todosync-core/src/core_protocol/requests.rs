//! Waiting-request registry
//!
//! Server calls are fire-and-forget on the transport; the response comes
//! back later as a downstream message carrying the same `request_id`.
//! Only responses to requests registered here are acted upon. Each entry
//! may carry a timeout task that resolves the caller's handle with
//! [`RequestOutcome::TimedOut`] and discards the entry, so a late response
//! is ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    RegisterPublicKey,
    CreateGroup,
    AddPeerToGroup,
    RemovePeerFromGroup,
    GetNotificationKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The server answered; `success` is its verdict
    Completed { success: bool },
    TimedOut,
    /// The request was cancelled before an answer arrived
    Abandoned,
}

/// Caller's side of a registered request
#[derive(Debug)]
pub struct RequestHandle {
    request_id: String,
    kind: RequestKind,
    outcome: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Wait until the request completes, times out or is cancelled
    pub async fn wait(self) -> RequestOutcome {
        self.outcome.await.unwrap_or(RequestOutcome::Abandoned)
    }
}

struct PendingRequest {
    kind: RequestKind,
    response_tx: oneshot::Sender<RequestOutcome>,
    /// Handle to abort the timeout task if the response arrives
    timeout_handle: Option<tokio::task::AbortHandle>,
}

pub struct WaitingRequests {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    timeout: Option<Duration>,
}

impl WaitingRequests {
    /// `None` waits for responses forever
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { pending: Arc::new(Mutex::new(HashMap::new())), timeout }
    }

    /// Register a new request under a fresh id
    pub async fn register(&self, kind: RequestKind) -> RequestHandle {
        let request_id = Uuid::new_v4().to_string();
        let (response_tx, outcome) = oneshot::channel();

        let timeout_handle = self.timeout.map(|timeout| {
            let pending = self.pending.clone();
            let id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(expired) = pending.lock().await.remove(&id) {
                    warn!(request_id = %id, kind = ?expired.kind, "Request timed out");
                    let _ = expired.response_tx.send(RequestOutcome::TimedOut);
                }
            })
            .abort_handle()
        });

        self.pending
            .lock()
            .await
            .insert(request_id.clone(), PendingRequest { kind, response_tx, timeout_handle });
        debug!(request_id = %request_id, kind = ?kind, "Waiting for response");

        RequestHandle { request_id, kind, outcome }
    }

    /// Match a response to a waiting request
    ///
    /// Returns `false` (and leaves the registry untouched) when nothing of
    /// `kind` is waiting under `request_id`.
    pub async fn try_resolve(&self, request_id: &str, kind: RequestKind, success: bool) -> bool {
        let mut pending = self.pending.lock().await;

        match pending.get(request_id) {
            Some(entry) if entry.kind == kind => {}
            Some(entry) => {
                warn!(
                    request_id = %request_id,
                    expected = ?entry.kind,
                    received = ?kind,
                    "Response kind does not match request"
                );
                return false;
            }
            None => {
                debug!(request_id = %request_id, "No request waiting for this response");
                return false;
            }
        }

        let Some(entry) = pending.remove(request_id) else {
            return false;
        };
        if let Some(handle) = entry.timeout_handle {
            handle.abort();
        }
        let _ = entry.response_tx.send(RequestOutcome::Completed { success });
        true
    }

    /// Drop a request whose upstream send failed
    pub async fn cancel(&self, request_id: &str) {
        if let Some(entry) = self.pending.lock().await.remove(request_id) {
            if let Some(handle) = entry.timeout_handle {
                handle.abort();
            }
            let _ = entry.response_tx.send(RequestOutcome::Abandoned);
        }
    }

    pub async fn is_waiting(&self, request_id: &str) -> bool {
        self.pending.lock().await.contains_key(request_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
