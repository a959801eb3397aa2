//! Pending Update Buffers
//!
//! Updates that arrive before their group is ready wait here until the
//! next drain. `pop_all` takes everything queued at that instant; pushes
//! racing with it land in the following drain.
//!
//! A buffer may carry a maximum age. Re-buffering keeps the original
//! arrival time, so an update that never becomes applicable goes stale
//! and is discarded by the caller instead of circulating forever.

use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Self-initialization of a freshly created group
    DocInit,
    /// Full snapshot from the peer that invited us
    PeerMerge,
    /// Change-set from a group member
    PeerUpdate,
}

impl BufferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::DocInit => "doc_init",
            BufferKind::PeerMerge => "peer_merge",
            BufferKind::PeerUpdate => "peer_update",
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub group_name: String,
    pub payload: String,
    pub id: String,
    /// First time the update was queued
    pub buffered_at: Instant,
}

pub struct UpdateBuffer {
    kind: BufferKind,
    max_age: Option<Duration>,
    pending: Mutex<Vec<PendingUpdate>>,
}

impl UpdateBuffer {
    pub fn new(kind: BufferKind) -> Self {
        Self { kind, max_age: None, pending: Mutex::new(Vec::new()) }
    }

    pub fn with_max_age(kind: BufferKind, max_age: Duration) -> Self {
        Self { kind, max_age: Some(max_age), pending: Mutex::new(Vec::new()) }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Queue a new update, returning its id
    pub async fn push(&self, group_name: &str, payload: &str) -> String {
        let update = PendingUpdate {
            group_name: group_name.to_string(),
            payload: payload.to_string(),
            id: Uuid::new_v4().to_string(),
            buffered_at: Instant::now(),
        };
        let id = update.id.clone();
        self.push_pending(update).await;
        id
    }

    /// Put an update back, keeping its id
    pub async fn push_pending(&self, update: PendingUpdate) {
        trace!(buffer = %self.kind, group = %update.group_name, id = %update.id, "Buffered update");
        let mut pending = self.pending.lock().await;
        pending.retain(|existing| existing.id != update.id);
        pending.push(update);
    }

    /// Remove and return everything queued, oldest first
    pub async fn pop_all(&self) -> Vec<PendingUpdate> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    /// Whether the update has waited longer than this buffer allows
    pub fn is_stale(&self, update: &PendingUpdate) -> bool {
        self.max_age.is_some_and(|max_age| update.buffered_at.elapsed() >= max_age)
    }

    /// Discard every queued update for a group, returning how many went
    pub async fn purge_group(&self, group_name: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|update| update.group_name != group_name);
        before - pending.len()
    }

    pub async fn has_pending(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Copy of the queue without draining it
    pub async fn pending(&self) -> Vec<PendingUpdate> {
        self.pending.lock().await.clone()
    }
}

/// The three buffers, drained in this order: doc-init, peer-merge, peer-update
pub struct UpdateBuffers {
    pub doc_init: UpdateBuffer,
    pub peer_merge: UpdateBuffer,
    pub peer_update: UpdateBuffer,
}

impl UpdateBuffers {
    pub fn new() -> Self {
        Self {
            doc_init: UpdateBuffer::new(BufferKind::DocInit),
            peer_merge: UpdateBuffer::new(BufferKind::PeerMerge),
            peer_update: UpdateBuffer::new(BufferKind::PeerUpdate),
        }
    }

    /// Buffers whose entries go stale after `max_age`
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            doc_init: UpdateBuffer::with_max_age(BufferKind::DocInit, max_age),
            peer_merge: UpdateBuffer::with_max_age(BufferKind::PeerMerge, max_age),
            peer_update: UpdateBuffer::with_max_age(BufferKind::PeerUpdate, max_age),
        }
    }

    pub fn get(&self, kind: BufferKind) -> &UpdateBuffer {
        match kind {
            BufferKind::DocInit => &self.doc_init,
            BufferKind::PeerMerge => &self.peer_merge,
            BufferKind::PeerUpdate => &self.peer_update,
        }
    }

    pub async fn has_pending(&self) -> bool {
        self.doc_init.has_pending().await
            || self.peer_merge.has_pending().await
            || self.peer_update.has_pending().await
    }

    /// Drop everything queued for a group this device no longer belongs to
    pub async fn purge_group(&self, group_name: &str) -> usize {
        let purged = self.doc_init.purge_group(group_name).await
            + self.peer_merge.purge_group(group_name).await
            + self.peer_update.purge_group(group_name).await;
        if purged > 0 {
            debug!(group = %group_name, purged, "Purged pending updates");
        }
        purged
    }
}

impl Default for UpdateBuffers {
    fn default() -> Self {
        Self::new()
    }
}
