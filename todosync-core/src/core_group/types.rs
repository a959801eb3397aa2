//! Group lifecycle types

use crate::core_crypto::SymmetricKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque serialized CRDT document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(String);

impl Snapshot {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Wrap engine output, dropping one layer of surrounding quotes
    ///
    /// Engines that hand back JSON-encoded strings produce `"..."`.
    pub fn from_engine_output(raw: &str) -> Self {
        let trimmed = raw
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(raw);
        Self(trimmed.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a group's document is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentState {
    /// No document yet; the state of a name before any registration
    Uninitialized,
    /// Created locally, waiting for the doc-init replay
    WaitingForSelfInit,
    /// Joined by invitation, waiting for a peer's snapshot
    WaitingForPeerMerge,
    Active(Snapshot),
}

impl DocumentState {
    pub fn is_active(&self) -> bool {
        matches!(self, DocumentState::Active(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DocumentState::Uninitialized => "uninitialized",
            DocumentState::WaitingForSelfInit => "waiting_for_self_init",
            DocumentState::WaitingForPeerMerge => "waiting_for_peer_merge",
            DocumentState::Active(_) => "active",
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to register a group
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub group_id: String,
    pub members: BTreeSet<String>,
    pub document: DocumentState,
    pub init_document: DocumentState,
    pub key: Option<SymmetricKey>,
}

impl NewGroup {
    /// Group created by this device
    pub fn awaiting_self_init(
        group_id: impl Into<String>,
        members: BTreeSet<String>,
        key: SymmetricKey,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            members,
            document: DocumentState::WaitingForSelfInit,
            init_document: DocumentState::WaitingForSelfInit,
            key: Some(key),
        }
    }

    /// Group this device was invited to
    pub fn awaiting_peer_merge(group_id: impl Into<String>, members: BTreeSet<String>) -> Self {
        Self {
            group_id: group_id.into(),
            members,
            document: DocumentState::WaitingForPeerMerge,
            init_document: DocumentState::WaitingForPeerMerge,
            key: None,
        }
    }
}
