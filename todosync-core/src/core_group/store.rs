//! Group Store
//!
//! Owns every locally known group, keyed by group name. Lookups on an
//! unknown name log an error and return `None`/`false`.
//!
//! Each group carries a one-permit semaphore. Any read-merge-write of the
//! group's document must hold the [`GroupLockGuard`] across the whole
//! sequence, including the CRDT call.

use super::types::{DocumentState, NewGroup, Snapshot};
use crate::core_crypto::SymmetricKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

struct GroupData {
    group_id: String,
    members: BTreeSet<String>,
    key: Option<SymmetricKey>,
    document: DocumentState,
    init_document: DocumentState,
    changes: Vec<String>,
    lock: Arc<Semaphore>,
}

impl From<NewGroup> for GroupData {
    fn from(group: NewGroup) -> Self {
        Self {
            group_id: group.group_id,
            members: group.members,
            key: group.key,
            document: group.document,
            init_document: group.init_document,
            changes: Vec::new(),
            lock: Arc::new(Semaphore::new(1)),
        }
    }
}

/// Exclusive access to one group's document; released on drop
#[derive(Debug)]
pub struct GroupLockGuard {
    group_name: String,
    _permit: OwnedSemaphorePermit,
}

impl GroupLockGuard {
    pub fn unlock(self) {
        debug!(group = %self.group_name, "Released group lock");
    }
}

#[derive(Default)]
pub struct GroupStore {
    groups: RwLock<HashMap<String, GroupData>>,
    current_group: RwLock<Option<String>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-only: returns `false` if the name is already taken
    pub async fn register_group(&self, name: &str, group: NewGroup) -> bool {
        let mut groups = self.groups.write().await;
        if groups.contains_key(name) {
            warn!(group = %name, "Group already registered");
            return false;
        }

        info!(
            group = %name,
            group_id = %group.group_id,
            members = group.members.len(),
            state = %group.document,
            "Registered group"
        );
        groups.insert(name.to_string(), group.into());
        true
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.groups.read().await.contains_key(name)
    }

    /// Sorted names of all registered groups
    pub async fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_group_id(&self, name: &str) -> Option<String> {
        self.read(name, |g| g.group_id.clone()).await
    }

    pub async fn get_document(&self, name: &str) -> Option<DocumentState> {
        self.read(name, |g| g.document.clone()).await
    }

    /// Lifecycle state of a name, `Uninitialized` when nothing is registered under it
    pub async fn document_state(&self, name: &str) -> DocumentState {
        self.groups
            .read()
            .await
            .get(name)
            .map(|g| g.document.clone())
            .unwrap_or(DocumentState::Uninitialized)
    }

    /// Store engine output as the active document
    pub async fn set_document(&self, name: &str, document: &str) -> bool {
        let snapshot = Snapshot::from_engine_output(document);
        self.write(name, |g| g.document = DocumentState::Active(snapshot)).await
    }

    pub async fn get_init_document(&self, name: &str) -> Option<DocumentState> {
        self.read(name, |g| g.init_document.clone()).await
    }

    pub async fn set_init_document(&self, name: &str, document: &str) -> bool {
        let snapshot = Snapshot::from_engine_output(document);
        self.write(name, |g| g.init_document = DocumentState::Active(snapshot)).await
    }

    /// `None` if the group is unknown or has no key yet
    pub async fn get_group_key(&self, name: &str) -> Option<SymmetricKey> {
        self.read(name, |g| g.key.clone()).await.flatten()
    }

    pub async fn set_group_key(&self, name: &str, key: SymmetricKey) -> bool {
        self.write(name, |g| g.key = Some(key)).await
    }

    pub async fn get_members(&self, name: &str) -> Option<BTreeSet<String>> {
        self.read(name, |g| g.members.clone()).await
    }

    pub async fn add_to_group(&self, name: &str, email: &str) -> bool {
        self.write(name, |g| {
            g.members.insert(email.to_string());
        })
        .await
    }

    pub async fn remove_peer(&self, name: &str, email: &str) -> bool {
        self.write(name, |g| {
            g.members.remove(email);
        })
        .await
    }

    pub async fn is_member(&self, name: &str, email: &str) -> bool {
        self.groups
            .read()
            .await
            .get(name)
            .map(|g| g.members.contains(email))
            .unwrap_or(false)
    }

    /// Forget the group entirely
    pub async fn leave_group(&self, name: &str) -> bool {
        let removed = self.groups.write().await.remove(name);
        let Some(group) = removed else {
            error!(group = %name, "Cannot leave unknown group");
            return false;
        };

        group.lock.close();

        let mut current = self.current_group.write().await;
        if current.as_deref() == Some(name) {
            *current = None;
        }

        info!(group = %name, "Left group");
        true
    }

    /// Append a change-set to the local change log
    pub async fn add_change(&self, name: &str, change_set: &str) -> bool {
        self.write(name, |g| {
            if !g.changes.iter().any(|c| c == change_set) {
                g.changes.push(change_set.to_string());
            }
        })
        .await
    }

    pub async fn get_changes(&self, name: &str) -> Option<Vec<String>> {
        self.read(name, |g| g.changes.clone()).await
    }

    /// Wait for exclusive access to a group
    ///
    /// Returns `None` for unknown groups, or if the group is left while
    /// waiting.
    pub async fn lock(&self, name: &str) -> Option<GroupLockGuard> {
        let semaphore = self.read(name, |g| g.lock.clone()).await?;

        match semaphore.acquire_owned().await {
            Ok(permit) => {
                debug!(group = %name, "Acquired group lock");
                Some(GroupLockGuard { group_name: name.to_string(), _permit: permit })
            }
            Err(_) => {
                warn!(group = %name, "Group was removed while waiting for its lock");
                None
            }
        }
    }

    pub async fn group_name_for_id(&self, group_id: &str) -> Option<String> {
        let name = self
            .groups
            .read()
            .await
            .iter()
            .find(|(_, g)| g.group_id == group_id)
            .map(|(name, _)| name.clone());

        if name.is_none() {
            warn!(group_id = %group_id, "No group with this id");
        }
        name
    }

    pub async fn current_group(&self) -> Option<String> {
        self.current_group.read().await.clone()
    }

    /// Select a group for the UI; `false` if the group is unknown
    pub async fn maybe_set_current_group(&self, name: &str) -> bool {
        if !self.contains(name).await {
            error!(group = %name, "Cannot select unknown group");
            return false;
        }
        *self.current_group.write().await = Some(name.to_string());
        true
    }

    async fn read<T>(&self, name: &str, f: impl FnOnce(&GroupData) -> T) -> Option<T> {
        let groups = self.groups.read().await;
        match groups.get(name) {
            Some(group) => Some(f(group)),
            None => {
                error!(group = %name, "Unknown group");
                None
            }
        }
    }

    async fn write(&self, name: &str, f: impl FnOnce(&mut GroupData)) -> bool {
        let mut groups = self.groups.write().await;
        match groups.get_mut(name) {
            Some(group) => {
                f(group);
                true
            }
            None => {
                error!(group = %name, "Unknown group");
                false
            }
        }
    }
}
