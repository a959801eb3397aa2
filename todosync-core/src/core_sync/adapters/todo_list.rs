//! TodoListEngine - op-based CRDT for a shared card list
//!
//! A document is a grow-only set of stamped operations. Each op id is a
//! Lamport pair `(counter, actor)`, so ids are unique per device and
//! totally ordered.
//!
//! - cards appear in insertion-id order
//! - a remove tombstones its target forever
//! - `completed` is last-writer-wins by op id
//!
//! Merge is set union, which makes remote application idempotent and
//! order-independent.

use crate::core_group::Snapshot;
use crate::core_sync::crdt::{Card, CardMutation, ChangeSet, CrdtEngine, LocalChange};
use crate::core_sync::errors::{CrdtError, CrdtResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Reserved: no op may carry this counter
const MAX_COUNTER: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CardOp {
    Insert { title: String, completed: bool },
    Remove { target: OpId },
    SetCompleted { target: OpId, completed: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedOp {
    pub id: OpId,
    pub op: CardOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<StampedOp>", into = "Vec<StampedOp>")]
pub struct TodoDocument {
    ops: BTreeMap<OpId, CardOp>,
}

impl From<Vec<StampedOp>> for TodoDocument {
    fn from(ops: Vec<StampedOp>) -> Self {
        Self { ops: ops.into_iter().map(|s| (s.id, s.op)).collect() }
    }
}

impl From<TodoDocument> for Vec<StampedOp> {
    fn from(doc: TodoDocument) -> Self {
        doc.ops.into_iter().map(|(id, op)| StampedOp { id, op }).collect()
    }
}

impl TodoDocument {
    fn next_counter(&self) -> CrdtResult<u64> {
        let highest = self.ops.keys().map(|id| id.counter).max().unwrap_or(0);
        highest
            .checked_add(1)
            .filter(|next| *next < MAX_COUNTER)
            .ok_or(CrdtError::CounterExhausted)
    }

    /// Reject ops whose counter leaves no room for a successor
    fn check_counters(ops: &[StampedOp]) -> Result<(), OpId> {
        match ops.iter().find(|s| s.id.counter == MAX_COUNTER) {
            Some(stamped) => Err(stamped.id.clone()),
            None => Ok(()),
        }
    }

    /// Visible cards with the id of the insert that created each one
    fn visible(&self) -> Vec<(&OpId, Card)> {
        let mut removed = HashSet::new();
        let mut completed: HashMap<&OpId, bool> = HashMap::new();

        for op in self.ops.values() {
            match op {
                CardOp::Remove { target } => {
                    removed.insert(target);
                }
                // ascending id order, so the last write wins
                CardOp::SetCompleted { target, completed: value } => {
                    completed.insert(target, *value);
                }
                CardOp::Insert { .. } => {}
            }
        }

        self.ops
            .iter()
            .filter_map(|(id, op)| match op {
                CardOp::Insert { title, completed: initial } if !removed.contains(id) => Some((
                    id,
                    Card {
                        title: title.clone(),
                        completed: completed.get(id).copied().unwrap_or(*initial),
                    },
                )),
                _ => None,
            })
            .collect()
    }

    fn target(&self, index: usize) -> CrdtResult<OpId> {
        let visible = self.visible();
        visible
            .get(index)
            .map(|(id, _)| (*id).clone())
            .ok_or(CrdtError::IndexOutOfRange { index, len: visible.len() })
    }

    fn absorb(&mut self, ops: impl IntoIterator<Item = (OpId, CardOp)>) {
        for (id, op) in ops {
            self.ops.entry(id).or_insert(op);
        }
    }
}

/// Card-list engine for one device
pub struct TodoListEngine {
    actor: String,
}

impl TodoListEngine {
    /// `actor` must be unique per device; the account email works
    pub fn new(actor: impl Into<String>) -> Self {
        Self { actor: actor.into() }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }
}

#[async_trait]
impl CrdtEngine for TodoListEngine {
    type Doc = TodoDocument;

    async fn create_empty_document(&self) -> CrdtResult<Snapshot> {
        self.save(&TodoDocument::default()).await
    }

    async fn load(&self, snapshot: &Snapshot) -> CrdtResult<TodoDocument> {
        let json = STANDARD
            .decode(snapshot.as_str())
            .map_err(|e| CrdtError::InvalidSnapshot(e.to_string()))?;
        let ops: Vec<StampedOp> =
            serde_json::from_slice(&json).map_err(|e| CrdtError::InvalidSnapshot(e.to_string()))?;
        TodoDocument::check_counters(&ops)
            .map_err(|id| CrdtError::InvalidSnapshot(format!("op counter out of range: {:?}", id)))?;
        Ok(TodoDocument::from(ops))
    }

    async fn save(&self, doc: &TodoDocument) -> CrdtResult<Snapshot> {
        let json = serde_json::to_vec(doc).map_err(|e| CrdtError::Engine(e.to_string()))?;
        Ok(Snapshot::new(STANDARD.encode(json)))
    }

    async fn apply_local_change(
        &self,
        mut doc: TodoDocument,
        event_name: &str,
        mutation: &CardMutation,
    ) -> CrdtResult<LocalChange<TodoDocument>> {
        if event_name != mutation.event_name() {
            return Err(CrdtError::EventMismatch {
                event: event_name.to_string(),
                mutation: mutation.event_name().to_string(),
            });
        }

        let op = match mutation {
            CardMutation::Add { title, completed } => {
                CardOp::Insert { title: title.clone(), completed: *completed }
            }
            CardMutation::Remove { index } => CardOp::Remove { target: doc.target(*index)? },
            CardMutation::SetCompleted { index, completed } => {
                CardOp::SetCompleted { target: doc.target(*index)?, completed: *completed }
            }
        };

        // engines may suspend here; callers hold the group lock across it
        tokio::task::yield_now().await;

        let stamped = StampedOp {
            id: OpId { counter: doc.next_counter()?, actor: self.actor.clone() },
            op,
        };
        let change_set = serde_json::to_string(&[&stamped])
            .map_err(|e| CrdtError::Engine(e.to_string()))?;
        doc.absorb([(stamped.id, stamped.op)]);

        Ok(LocalChange { document: doc, change_set: ChangeSet::new(change_set) })
    }

    async fn apply_remote_changes(
        &self,
        mut doc: TodoDocument,
        changes: &ChangeSet,
    ) -> CrdtResult<TodoDocument> {
        let ops: Vec<StampedOp> = serde_json::from_str(changes.as_str())
            .map_err(|e| CrdtError::InvalidChangeSet(e.to_string()))?;
        TodoDocument::check_counters(&ops)
            .map_err(|id| CrdtError::InvalidChangeSet(format!("op counter out of range: {:?}", id)))?;
        doc.absorb(ops.into_iter().map(|s| (s.id, s.op)));
        Ok(doc)
    }

    async fn merge(&self, mut doc_a: TodoDocument, doc_b: TodoDocument) -> CrdtResult<TodoDocument> {
        doc_a.absorb(doc_b.ops);
        Ok(doc_a)
    }

    async fn cards(&self, doc: &TodoDocument) -> CrdtResult<Vec<Card>> {
        Ok(doc.visible().into_iter().map(|(_, card)| card).collect())
    }
}
