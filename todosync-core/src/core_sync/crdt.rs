//! CrdtEngine trait - the document engine behind a group
//!
//! The sync engine never looks inside documents. It loads a [`Snapshot`],
//! hands the engine a mutation or a peer's [`ChangeSet`], and stores the
//! snapshot that comes back.
//!
//! ```text
//! SyncEngine
//!     |
//!     v
//! CrdtEngine (trait)
//!     |
//!     +---> TodoListEngine (op-based card list)
//!     |
//!     +---> any other engine with the same contract
//! ```

use super::errors::CrdtResult;
use crate::core_group::Snapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One to-do item as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub title: String,
    pub completed: bool,
}

/// A user edit to the card list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardMutation {
    Add { title: String, completed: bool },
    Remove { index: usize },
    SetCompleted { index: usize, completed: bool },
}

impl CardMutation {
    pub fn event_name(&self) -> &'static str {
        match self {
            CardMutation::Add { .. } => "add_card",
            CardMutation::Remove { .. } => "remove_card",
            CardMutation::SetCompleted { .. } => "set_card_completed",
        }
    }
}

/// Opaque serialized changes produced by a local edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(String);

impl ChangeSet {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of [`CrdtEngine::apply_local_change`]
#[derive(Debug, Clone)]
pub struct LocalChange<D> {
    pub document: D,
    pub change_set: ChangeSet,
}

#[async_trait]
pub trait CrdtEngine: Send + Sync {
    /// In-memory document handle
    type Doc: Send + Sync;

    /// Snapshot of a fresh document with no cards
    async fn create_empty_document(&self) -> CrdtResult<Snapshot>;

    async fn load(&self, snapshot: &Snapshot) -> CrdtResult<Self::Doc>;

    async fn save(&self, doc: &Self::Doc) -> CrdtResult<Snapshot>;

    /// Apply a user edit, returning the new document and the changes to broadcast
    async fn apply_local_change(
        &self,
        doc: Self::Doc,
        event_name: &str,
        mutation: &CardMutation,
    ) -> CrdtResult<LocalChange<Self::Doc>>;

    /// Apply a peer's changes; applying the same changes twice is harmless
    async fn apply_remote_changes(&self, doc: Self::Doc, changes: &ChangeSet) -> CrdtResult<Self::Doc>;

    async fn merge(&self, doc_a: Self::Doc, doc_b: Self::Doc) -> CrdtResult<Self::Doc>;

    /// Materialize the card list
    async fn cards(&self, doc: &Self::Doc) -> CrdtResult<Vec<Card>>;
}
