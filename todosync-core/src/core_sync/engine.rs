//! Sync Engine - group lifecycle and update sequencing
//!
//! Drives every group through its lifecycle and decides, for each update,
//! whether it can be applied now or has to wait in a buffer.
//!
//! # Lifecycle
//!
//! ```text
//!                create_group_response          doc-init replay
//! UNREGISTERED ───────────────────────► SELF_INIT ───────────────► ACTIVE
//!      │                                                              ▲
//!      │ added_to_group                       peer-merge replay       │
//!      └──────────────────────────────► PEER_MERGE ───────────────────┘
//! ```
//!
//! # Sequencing
//!
//! Inbound updates are pushed to one of three [`UpdateBuffers`] and the
//! buffers are drained doc-init first, then peer-merge, then peer-update.
//! A drain cycle replays each queued update once under the group lock.
//! Peer updates for a group that is still waiting go back into the buffer
//! for the next cycle. Group keys and documents that overtake
//! `added_to_group` wait in peer-merge until the group is registered.
//! Whatever waits longer than `sync.pending_max_age` is discarded, and
//! leaving a group purges its queued updates.
//!
//! # Trust
//!
//! Server traffic must verify against the configured server key. Peer and
//! group traffic must verify against the sender's key from the address
//! book, and the sender must be a member of the group it talks about.

use super::crdt::{Card, CardMutation, ChangeSet, CrdtEngine};
use super::errors::{CrdtResult, DropReason, InboundOutcome, SyncError, SyncResult};
use super::transport::Transport;
use crate::config::SyncConfig;
use crate::core_contacts::AddressBook;
use crate::core_crypto::{
    generate_symmetric_key, key_to_string, string_to_public_key, string_to_symmetric_key,
    CryptoProvider, PublicKey, SymmetricKey,
};
use crate::core_envelope::{Envelope, EnvelopeCodec, GroupEnvelope};
use crate::core_group::{
    DocumentState, GroupStore, NewGroup, PendingUpdate, Snapshot, UpdateBuffer, UpdateBuffers,
};
use crate::core_protocol::{
    decode, encode, DownstreamMessage, GroupMessage, MemberInfo, PeerMessage, RequestHandle,
    RequestKind, UpstreamMessage, WaitingRequests,
};
use crate::metrics::{self, record_counter, Timer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// This device's identity
pub struct Identity {
    pub email: String,
    pub crypto: Arc<CryptoProvider>,
}

impl Identity {
    pub fn new(email: impl Into<String>, crypto: Arc<CryptoProvider>) -> Self {
        Self { email: email.into(), crypto }
    }
}

/// Where upstream traffic goes and how the server authenticates
#[derive(Clone)]
pub struct ServerEndpoint {
    pub address: String,
    pub public_key: PublicKey,
}

/// Shared state injected into the engine
#[derive(Clone)]
pub struct SyncServices {
    pub contacts: Arc<AddressBook>,
    pub groups: Arc<GroupStore>,
    pub buffers: Arc<UpdateBuffers>,
    pub requests: Arc<WaitingRequests>,
}

impl SyncServices {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            contacts: Arc::new(AddressBook::new()),
            groups: Arc::new(GroupStore::new()),
            buffers: Arc::new(UpdateBuffers::with_max_age(config.pending_max_age)),
            requests: Arc::new(WaitingRequests::new(config.effective_timeout())),
        }
    }
}

/// Peer message parked in the peer-merge buffer until its group is
/// registered; sender and group id are re-checked at replay time
#[derive(Debug, Serialize, Deserialize)]
struct HeldPeerMessage {
    sender: String,
    group_id: String,
    content: HeldContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HeldContent {
    Document { document: Snapshot },
    GroupKey { key: String },
}

pub struct SyncEngine<C: CrdtEngine, T: Transport> {
    identity: Identity,
    server: ServerEndpoint,
    codec: EnvelopeCodec,
    services: SyncServices,
    crdt: Arc<C>,
    transport: Arc<T>,
    /// Serializes drain cycles
    drain_lock: Mutex<()>,
}

impl<C: CrdtEngine, T: Transport> SyncEngine<C, T> {
    pub fn new(
        identity: Identity,
        server: ServerEndpoint,
        services: SyncServices,
        crdt: Arc<C>,
        transport: Arc<T>,
    ) -> Self {
        info!(email = %identity.email, server = %server.address, "Creating SyncEngine");

        let codec = EnvelopeCodec::new(
            identity.email.clone(),
            identity.crypto.clone(),
            services.contacts.clone(),
            server.public_key.clone(),
        );

        Self { identity, server, codec, services, crdt, transport, drain_lock: Mutex::new(()) }
    }

    pub fn email(&self) -> &str {
        &self.identity.email
    }

    pub fn groups(&self) -> &Arc<GroupStore> {
        &self.services.groups
    }

    pub fn contacts(&self) -> &Arc<AddressBook> {
        &self.services.contacts
    }

    pub fn buffers(&self) -> &Arc<UpdateBuffers> {
        &self.services.buffers
    }

    pub fn requests(&self) -> &Arc<WaitingRequests> {
        &self.services.requests
    }

    pub fn crdt(&self) -> &Arc<C> {
        &self.crdt
    }

    // ---------------------------------------------------------------------
    // Server requests
    // ---------------------------------------------------------------------

    /// Announce this device's public key to the server
    pub async fn register_public_key(&self) -> SyncResult<RequestHandle> {
        let message = UpstreamMessage::RegisterPublicKey {
            email: self.identity.email.clone(),
            public_key: self.identity.crypto.public_key_string()?,
        };
        self.send_request(RequestKind::RegisterPublicKey, message).await
    }

    /// Ask the server to create a group; the group exists locally once the
    /// response arrives
    pub async fn create_group(&self, group_name: &str, invite: &[&str]) -> SyncResult<RequestHandle> {
        if self.groups().contains(group_name).await {
            return Err(SyncError::GroupExists(group_name.to_string()));
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        info!(group = %group_name, group_id = %group_id, invited = invite.len(), "Creating group");

        let message = UpstreamMessage::CreateGroup {
            group_name: group_name.to_string(),
            group_id,
            member_emails: invite.iter().map(|e| e.to_string()).collect(),
        };
        self.send_request(RequestKind::CreateGroup, message).await
    }

    pub async fn add_peer_to_group(&self, group_name: &str, peer_email: &str) -> SyncResult<RequestHandle> {
        let group_id = self.group_id(group_name).await?;
        let message = UpstreamMessage::AddPeerToGroup {
            group_name: group_name.to_string(),
            group_id,
            peer_email: peer_email.to_string(),
        };
        self.send_request(RequestKind::AddPeerToGroup, message).await
    }

    pub async fn remove_peer_from_group(
        &self,
        group_name: &str,
        peer_email: &str,
    ) -> SyncResult<RequestHandle> {
        let group_id = self.group_id(group_name).await?;
        let message = UpstreamMessage::RemovePeerFromGroup {
            group_name: group_name.to_string(),
            group_id,
            peer_email: peer_email.to_string(),
        };
        self.send_request(RequestKind::RemovePeerFromGroup, message).await
    }

    /// Look up a peer's current push token
    pub async fn request_notification_key(&self, email: &str) -> SyncResult<RequestHandle> {
        let message = UpstreamMessage::GetNotificationKey { email: email.to_string() };
        self.send_request(RequestKind::GetNotificationKey, message).await
    }

    // ---------------------------------------------------------------------
    // Local edits
    // ---------------------------------------------------------------------

    pub async fn add_card(&self, group_name: &str, title: &str) -> SyncResult<ChangeSet> {
        let mutation = CardMutation::Add { title: title.to_string(), completed: false };
        self.apply_local_edit(group_name, mutation).await
    }

    pub async fn remove_card(&self, group_name: &str, index: usize) -> SyncResult<ChangeSet> {
        self.apply_local_edit(group_name, CardMutation::Remove { index }).await
    }

    pub async fn set_card_completed(
        &self,
        group_name: &str,
        index: usize,
        completed: bool,
    ) -> SyncResult<ChangeSet> {
        self.apply_local_edit(group_name, CardMutation::SetCompleted { index, completed }).await
    }

    /// Apply a user edit and broadcast the resulting change-set
    ///
    /// The document is updated even if the broadcast fails; the error is
    /// still returned so the caller knows peers did not get it.
    pub async fn apply_local_edit(
        &self,
        group_name: &str,
        mutation: CardMutation,
    ) -> SyncResult<ChangeSet> {
        let timer = Timer::new(metrics::LOCAL_CHANGE_DURATION);
        let groups = self.groups();

        let guard = groups
            .lock(group_name)
            .await
            .ok_or_else(|| SyncError::UnknownGroup(group_name.to_string()))?;

        let snapshot = match groups.get_document(group_name).await {
            Some(DocumentState::Active(snapshot)) => snapshot,
            Some(state) => {
                return Err(SyncError::LifecycleMismatch {
                    group: group_name.to_string(),
                    state: state.to_string(),
                })
            }
            None => return Err(SyncError::UnknownGroup(group_name.to_string())),
        };

        let doc = self.crdt.load(&snapshot).await?;
        let change = self.crdt.apply_local_change(doc, mutation.event_name(), &mutation).await?;
        let updated = self.crdt.save(&change.document).await?;

        groups.set_document(group_name, updated.as_str()).await;
        groups.add_change(group_name, change.change_set.as_str()).await;
        guard.unlock();
        timer.stop();

        info!(group = %group_name, event = mutation.event_name(), "Applied local change");

        self.broadcast_changes(group_name, &change.change_set).await?;
        Ok(change.change_set)
    }

    /// Current card list; empty while the group is still waiting
    pub async fn cards(&self, group_name: &str) -> SyncResult<Vec<Card>> {
        match self.groups().get_document(group_name).await {
            Some(DocumentState::Active(snapshot)) => {
                let doc = self.crdt.load(&snapshot).await?;
                Ok(self.crdt.cards(&doc).await?)
            }
            Some(_) => Ok(Vec::new()),
            None => Err(SyncError::UnknownGroup(group_name.to_string())),
        }
    }

    /// Send a change-set to a single member instead of the whole group
    pub async fn send_changes_to_peer(
        &self,
        group_name: &str,
        changes: &ChangeSet,
        peer_email: &str,
    ) -> SyncResult<()> {
        if !self.groups().is_member(group_name, peer_email).await {
            return Err(SyncError::UnknownContact(peer_email.to_string()));
        }
        let message = PeerMessage::Changes {
            group_id: self.group_id(group_name).await?,
            group_name: group_name.to_string(),
            changes: changes.as_str().to_string(),
        };
        self.send_to_peer(peer_email, &message).await
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Entry point for every envelope the transport delivers
    pub async fn handle_inbound(&self, envelope: Envelope) -> InboundOutcome {
        record_counter(metrics::MESSAGES_RECEIVED, 1);

        let outcome = self.route_inbound(envelope).await;
        if let InboundOutcome::Dropped(reason) = outcome {
            record_counter(metrics::MESSAGES_DROPPED, 1);
            warn!(reason = %reason, "Dropped inbound message");
        }
        outcome
    }

    async fn route_inbound(&self, envelope: Envelope) -> InboundOutcome {
        let payload = match self.codec.unwrap(&envelope, &self.server.public_key) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Could not open server envelope");
                return InboundOutcome::Dropped(DropReason::from(&e));
            }
        };

        let message: DownstreamMessage = match decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Malformed downstream payload");
                return InboundOutcome::Dropped(DropReason::MalformedPayload);
            }
        };
        debug!(kind = message.kind(), "Received downstream message");

        if let Some((request_id, success)) = message.response_status() {
            let Some(kind) = request_kind(&message) else {
                return InboundOutcome::Dropped(DropReason::MalformedPayload);
            };
            if !self.requests().try_resolve(request_id, kind, success).await {
                return InboundOutcome::Dropped(DropReason::UnsolicitedResponse);
            }
            if !success {
                warn!(kind = message.kind(), request_id = %request_id, "Server rejected request");
                return InboundOutcome::Handled;
            }
        }

        match message {
            DownstreamMessage::CreateGroupResponse { group_name, group_id, members, .. } => {
                self.on_group_created(&group_name, &group_id, &members).await
            }
            DownstreamMessage::AddedToGroup { group_name, group_id, members } => {
                self.on_added_to_group(&group_name, &group_id, &members).await
            }
            DownstreamMessage::AddPeerToGroupResponse { group_name, peer, .. } => match peer {
                Some(peer) => self.on_peer_added(&group_name, &peer).await,
                None => InboundOutcome::Dropped(DropReason::MalformedPayload),
            },
            DownstreamMessage::AddedPeerToGroup {
                group_name,
                peer_email,
                peer_token,
                peer_public_key,
            } => {
                self.on_peer_joined(&group_name, &peer_email, &peer_token, &peer_public_key)
                    .await
            }
            DownstreamMessage::RemovePeerFromGroupResponse { group_name, peer_email, .. }
            | DownstreamMessage::RemovedPeerFromGroup { group_name, peer_email } => {
                self.on_peer_removed(&group_name, &peer_email).await
            }
            DownstreamMessage::GetNotificationKeyResponse { email, notification_key, .. } => {
                match notification_key {
                    Some(token) if self.contacts().update_token(&email, &token).await => {
                        InboundOutcome::Handled
                    }
                    Some(_) => InboundOutcome::Dropped(DropReason::UnknownContact),
                    None => InboundOutcome::Handled,
                }
            }
            DownstreamMessage::RegisterPublicKeyResponse { .. } => {
                info!("Public key registered with server");
                InboundOutcome::Handled
            }
            DownstreamMessage::ForwardToPeer { peer_message } => {
                self.on_peer_message(&peer_message).await
            }
            DownstreamMessage::ForwardToGroup { group_message } => {
                self.on_group_message(&group_message).await
            }
        }
    }

    async fn on_group_created(
        &self,
        group_name: &str,
        group_id: &str,
        members: &[MemberInfo],
    ) -> InboundOutcome {
        let emails = self.capture_contacts(members).await;
        let key = generate_symmetric_key();

        let group = NewGroup::awaiting_self_init(group_id, emails.clone(), key.clone());
        if !self.groups().register_group(group_name, group).await {
            return InboundOutcome::Dropped(DropReason::GroupExists);
        }

        self.note_buffered(self.buffers().doc_init.push(group_name, group_id).await);

        for peer in &emails {
            if let Err(e) = self.send_group_key(group_name, group_id, &key, peer).await {
                warn!(group = %group_name, peer = %peer, error = %e, "Could not send group key");
            }
        }

        self.drain_buffers().await;
        InboundOutcome::Handled
    }

    async fn on_added_to_group(
        &self,
        group_name: &str,
        group_id: &str,
        members: &[MemberInfo],
    ) -> InboundOutcome {
        let emails = self.capture_contacts(members).await;

        let group = NewGroup::awaiting_peer_merge(group_id, emails);
        if !self.groups().register_group(group_name, group).await {
            return InboundOutcome::Dropped(DropReason::GroupExists);
        }
        info!(group = %group_name, "Joined group, waiting for document");

        // a document may already be waiting for us
        self.drain_buffers().await;
        InboundOutcome::Handled
    }

    /// Our own add-peer request succeeded: bring the new member up to date
    async fn on_peer_added(&self, group_name: &str, peer: &MemberInfo) -> InboundOutcome {
        let outcome = self
            .on_peer_joined(group_name, &peer.email, &peer.token, &peer.public_key)
            .await;
        if !outcome.is_handled() {
            return outcome;
        }

        let Some(group_id) = self.groups().get_group_id(group_name).await else {
            return InboundOutcome::Dropped(DropReason::UnknownGroup);
        };

        if let Some(key) = self.groups().get_group_key(group_name).await {
            if let Err(e) = self.send_group_key(group_name, &group_id, &key, &peer.email).await {
                warn!(group = %group_name, peer = %peer.email, error = %e, "Could not send group key");
            }
        }

        // still initializing: the doc-init replay shares the document with every member
        if let Some(DocumentState::Active(snapshot)) = self.groups().get_document(group_name).await {
            let message = PeerMessage::DocumentInit {
                group_id,
                group_name: group_name.to_string(),
                document: snapshot,
            };
            if let Err(e) = self.send_to_peer(&peer.email, &message).await {
                warn!(group = %group_name, peer = %peer.email, error = %e, "Could not send document");
            }
        }

        InboundOutcome::Handled
    }

    async fn on_peer_joined(
        &self,
        group_name: &str,
        peer_email: &str,
        token: &str,
        public_key: &str,
    ) -> InboundOutcome {
        if peer_email == self.email() {
            return InboundOutcome::Handled;
        }
        let public_key = match string_to_public_key(public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %peer_email, error = %e, "Peer announced an invalid public key");
                return InboundOutcome::Dropped(DropReason::MalformedPayload);
            }
        };

        if !self.groups().add_to_group(group_name, peer_email).await {
            return InboundOutcome::Dropped(DropReason::UnknownGroup);
        }
        self.contacts().add_contact(peer_email, token, public_key).await;
        info!(group = %group_name, peer = %peer_email, "Peer joined group");
        InboundOutcome::Handled
    }

    async fn on_peer_removed(&self, group_name: &str, peer_email: &str) -> InboundOutcome {
        let known = if peer_email == self.email() {
            let left = self.groups().leave_group(group_name).await;
            self.buffers().purge_group(group_name).await;
            left
        } else {
            self.groups().remove_peer(group_name, peer_email).await
        };

        if known {
            info!(group = %group_name, peer = %peer_email, "Peer removed from group");
            InboundOutcome::Handled
        } else {
            InboundOutcome::Dropped(DropReason::UnknownGroup)
        }
    }

    async fn on_peer_message(&self, envelope: &Envelope) -> InboundOutcome {
        let sender = envelope.sender_email.as_str();
        if sender == self.email() {
            return InboundOutcome::Dropped(DropReason::FromSelf);
        }

        let Some(sender_key) = self.contacts().get_contact_key(sender).await else {
            return InboundOutcome::Dropped(DropReason::UnknownContact);
        };
        let payload = match self.codec.unwrap(envelope, &sender_key) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %sender, error = %e, "Could not open peer envelope");
                return InboundOutcome::Dropped(DropReason::from(&e));
            }
        };
        let message: PeerMessage = match decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %sender, error = %e, "Malformed peer payload");
                return InboundOutcome::Dropped(DropReason::MalformedPayload);
            }
        };

        let group_name = self.groups().group_name_for_id(message.group_id()).await;
        if let Some(name) = &group_name {
            if !self.groups().is_member(name, sender).await {
                warn!(group = %name, peer = %sender, "Peer message from non-member");
                return InboundOutcome::Dropped(DropReason::NotAMember);
            }
        }

        match (message, group_name) {
            (PeerMessage::GroupKey { key, .. }, Some(name)) => {
                self.install_group_key(&name, sender, &key).await
            }
            // the key can overtake added_to_group; hold it until the group exists
            (PeerMessage::GroupKey { group_id, group_name: announced, key }, None) => {
                if string_to_symmetric_key(&key).is_err() {
                    return InboundOutcome::Dropped(DropReason::MalformedPayload);
                }
                self.hold_for_group(&announced, sender, group_id, HeldContent::GroupKey { key })
                    .await
            }
            (PeerMessage::DocumentInit { group_id, group_name: announced, document }, known) => {
                let name = known.unwrap_or(announced);
                self.hold_for_group(&name, sender, group_id, HeldContent::Document { document })
                    .await
            }
            (PeerMessage::Changes { changes, .. }, Some(name)) => {
                self.note_buffered(self.buffers().peer_update.push(&name, &changes).await);
                self.drain_buffers().await;
                InboundOutcome::Handled
            }
            (PeerMessage::Changes { .. }, None) => InboundOutcome::Dropped(DropReason::UnknownGroup),
        }
    }

    async fn hold_for_group(
        &self,
        group_name: &str,
        sender: &str,
        group_id: String,
        content: HeldContent,
    ) -> InboundOutcome {
        let held = HeldPeerMessage { sender: sender.to_string(), group_id, content };
        let payload = match encode(&held) {
            Ok(payload) => payload,
            Err(_) => return InboundOutcome::Dropped(DropReason::MalformedPayload),
        };
        self.note_buffered(self.buffers().peer_merge.push(group_name, &payload).await);
        self.drain_buffers().await;
        InboundOutcome::Handled
    }

    async fn install_group_key(&self, group_name: &str, sender: &str, key: &str) -> InboundOutcome {
        match string_to_symmetric_key(key) {
            Ok(key) => {
                self.groups().set_group_key(group_name, key).await;
                info!(group = %group_name, peer = %sender, "Received group key");
                InboundOutcome::Handled
            }
            Err(_) => InboundOutcome::Dropped(DropReason::MalformedPayload),
        }
    }

    async fn on_group_message(&self, envelope: &GroupEnvelope) -> InboundOutcome {
        let sender = envelope.sender_email.as_str();
        if sender == self.email() {
            return InboundOutcome::Dropped(DropReason::FromSelf);
        }

        let groups = self.groups();
        let Some(group_name) = groups.group_name_for_id(&envelope.group_id).await else {
            return InboundOutcome::Dropped(DropReason::UnknownGroup);
        };
        if !groups.is_member(&group_name, sender).await {
            warn!(group = %group_name, peer = %sender, "Group message from non-member");
            return InboundOutcome::Dropped(DropReason::NotAMember);
        }
        let Some(sender_key) = self.contacts().get_contact_key(sender).await else {
            return InboundOutcome::Dropped(DropReason::UnknownContact);
        };
        let Some(group_key) = groups.get_group_key(&group_name).await else {
            warn!(group = %group_name, "No group key yet, dropping group message");
            return InboundOutcome::Dropped(DropReason::MissingGroupKey);
        };

        let payload = match self.codec.open_group(envelope, &group_key, &sender_key) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(group = %group_name, peer = %sender, error = %e, "Could not open group message");
                return InboundOutcome::Dropped(DropReason::from(&e));
            }
        };

        match decode::<GroupMessage>(&payload) {
            Ok(GroupMessage::Changes { changes }) => {
                self.note_buffered(self.buffers().peer_update.push(&group_name, &changes).await);
                self.drain_buffers().await;
                InboundOutcome::Handled
            }
            Err(e) => {
                warn!(group = %group_name, error = %e, "Malformed group payload");
                InboundOutcome::Dropped(DropReason::MalformedPayload)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Buffer replay
    // ---------------------------------------------------------------------

    /// Replay everything currently buffered: doc-init, then peer-merge,
    /// then peer-update
    pub async fn drain_buffers(&self) {
        let _cycle = self.drain_lock.lock().await;

        for update in self.buffers().doc_init.pop_all().await {
            self.replay_doc_init(update).await;
        }
        for update in self.buffers().peer_merge.pop_all().await {
            self.replay_peer_merge(update).await;
        }
        for update in self.buffers().peer_update.pop_all().await {
            self.replay_peer_update(update).await;
        }
    }

    async fn replay_doc_init(&self, update: PendingUpdate) {
        let groups = self.groups();
        let name = update.group_name.as_str();

        let Some(guard) = groups.lock(name).await else {
            warn!(group = %name, "Dropping doc-init for unknown group");
            return;
        };
        match groups.get_document(name).await {
            Some(DocumentState::WaitingForSelfInit) => {}
            state => {
                warn!(group = %name, state = ?state, "Group already initialized, dropping doc-init");
                return;
            }
        }

        let snapshot = match self.crdt.create_empty_document().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                drop(guard);
                self.replay_failed(&self.buffers().doc_init, update, e.is_retryable(), &e.to_string())
                    .await;
                return;
            }
        };

        groups.set_document(name, snapshot.as_str()).await;
        groups.set_init_document(name, snapshot.as_str()).await;
        guard.unlock();

        record_counter(metrics::UPDATES_APPLIED, 1);
        info!(group = %name, "Initialized group document");

        self.share_document(name, &snapshot).await;
    }

    async fn replay_peer_merge(&self, update: PendingUpdate) {
        let groups = self.groups();
        let name = update.group_name.as_str();

        let held: HeldPeerMessage = match decode(&update.payload) {
            Ok(held) => held,
            Err(e) => {
                error!(group = %name, error = %e, "Corrupt peer-merge entry");
                return;
            }
        };

        if !groups.contains(name).await {
            debug!(group = %name, "Group not registered yet, holding peer message");
            self.rebuffer(&self.buffers().peer_merge, update).await;
            return;
        }
        if groups.get_group_id(name).await.as_deref() != Some(held.group_id.as_str())
            || !groups.is_member(name, &held.sender).await
        {
            warn!(group = %name, peer = %held.sender, "Held peer message does not belong to this group");
            return;
        }

        match held.content {
            HeldContent::GroupKey { key } => {
                self.install_group_key(name, &held.sender, &key).await;
            }
            HeldContent::Document { document } => {
                self.merge_peer_document(&held.sender, &document, update).await;
            }
        }
    }

    async fn merge_peer_document(&self, sender: &str, document: &Snapshot, update: PendingUpdate) {
        let groups = self.groups();
        let name = update.group_name.as_str();

        let Some(guard) = groups.lock(name).await else {
            return;
        };
        match groups.get_document(name).await {
            Some(DocumentState::WaitingForPeerMerge) => {}
            state => {
                warn!(group = %name, state = ?state, "Not waiting for a peer document, dropping it");
                return;
            }
        }

        let timer = Timer::new(metrics::REMOTE_CHANGE_DURATION);
        match self.merge_into_empty(document).await {
            Ok(snapshot) => {
                groups.set_document(name, snapshot.as_str()).await;
                groups.set_init_document(name, snapshot.as_str()).await;
                guard.unlock();
                timer.stop();
                record_counter(metrics::UPDATES_APPLIED, 1);
                info!(group = %name, peer = %sender, "Merged peer document");
            }
            Err(e) => {
                drop(guard);
                self.replay_failed(&self.buffers().peer_merge, update, e.is_retryable(), &e.to_string())
                    .await;
            }
        }
    }

    async fn replay_peer_update(&self, update: PendingUpdate) {
        let groups = self.groups();
        let name = update.group_name.as_str();

        let Some(guard) = groups.lock(name).await else {
            warn!(group = %name, "Dropping update for unknown group");
            return;
        };

        let snapshot = match groups.get_document(name).await {
            Some(DocumentState::Active(snapshot)) => snapshot,
            Some(state) => {
                drop(guard);
                debug!(group = %name, state = %state, "Group not active yet, keeping update");
                self.rebuffer(&self.buffers().peer_update, update).await;
                return;
            }
            None => return,
        };

        let timer = Timer::new(metrics::REMOTE_CHANGE_DURATION);
        let changes = ChangeSet::new(update.payload.clone());
        match self.apply_remote(&snapshot, &changes).await {
            Ok(snapshot) => {
                groups.set_document(name, snapshot.as_str()).await;
                guard.unlock();
                timer.stop();
                record_counter(metrics::UPDATES_APPLIED, 1);
                debug!(group = %name, "Applied peer update");
            }
            Err(e) => {
                drop(guard);
                self.replay_failed(&self.buffers().peer_update, update, e.is_retryable(), &e.to_string())
                    .await;
            }
        }
    }

    async fn merge_into_empty(&self, received: &Snapshot) -> CrdtResult<Snapshot> {
        let empty = self.crdt.load(&self.crdt.create_empty_document().await?).await?;
        let received = self.crdt.load(received).await?;
        let doc = self.crdt.merge(empty, received).await?;
        self.crdt.save(&doc).await
    }

    async fn apply_remote(&self, snapshot: &Snapshot, changes: &ChangeSet) -> CrdtResult<Snapshot> {
        let doc = self.crdt.load(snapshot).await?;
        let doc = self.crdt.apply_remote_changes(doc, changes).await?;
        self.crdt.save(&doc).await
    }

    async fn replay_failed(&self, buffer: &UpdateBuffer, update: PendingUpdate, retry: bool, error: &str) {
        if retry {
            warn!(group = %update.group_name, buffer = %buffer.kind(), error = %error, "Replay failed, will retry");
            self.rebuffer(buffer, update).await;
        } else {
            error!(group = %update.group_name, buffer = %buffer.kind(), error = %error, "Replay failed, dropping update");
        }
    }

    /// Put an update back for the next drain unless it has gone stale
    async fn rebuffer(&self, buffer: &UpdateBuffer, update: PendingUpdate) {
        if buffer.is_stale(&update) {
            record_counter(metrics::UPDATES_EXPIRED, 1);
            warn!(group = %update.group_name, buffer = %buffer.kind(), id = %update.id, "Pending update expired");
            return;
        }
        record_counter(metrics::UPDATES_REBUFFERED, 1);
        buffer.push_pending(update).await;
    }

    fn note_buffered(&self, id: String) {
        record_counter(metrics::UPDATES_BUFFERED, 1);
        debug!(id = %id, "Buffered update");
    }

    // ---------------------------------------------------------------------
    // Outbound helpers
    // ---------------------------------------------------------------------

    async fn group_id(&self, group_name: &str) -> SyncResult<String> {
        self.groups()
            .get_group_id(group_name)
            .await
            .ok_or_else(|| SyncError::UnknownGroup(group_name.to_string()))
    }

    /// Store members' keys and tokens, returning their emails
    async fn capture_contacts(&self, members: &[MemberInfo]) -> BTreeSet<String> {
        let mut emails = BTreeSet::new();
        for member in members.iter().filter(|m| m.email != self.identity.email) {
            match string_to_public_key(&member.public_key) {
                Ok(key) => {
                    self.contacts().add_contact(&member.email, &member.token, key).await;
                    emails.insert(member.email.clone());
                }
                Err(e) => warn!(peer = %member.email, error = %e, "Skipping member with invalid key"),
            }
        }
        emails
    }

    async fn share_document(&self, group_name: &str, snapshot: &Snapshot) {
        let (Some(group_id), Some(members)) = (
            self.groups().get_group_id(group_name).await,
            self.groups().get_members(group_name).await,
        ) else {
            return;
        };

        for peer in &members {
            let message = PeerMessage::DocumentInit {
                group_id: group_id.clone(),
                group_name: group_name.to_string(),
                document: snapshot.clone(),
            };
            if let Err(e) = self.send_to_peer(peer, &message).await {
                warn!(group = %group_name, peer = %peer, error = %e, "Could not send document");
            }
        }
    }

    async fn send_group_key(
        &self,
        group_name: &str,
        group_id: &str,
        key: &SymmetricKey,
        peer_email: &str,
    ) -> SyncResult<()> {
        let message = PeerMessage::GroupKey {
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            key: key_to_string(key),
        };
        self.send_to_peer(peer_email, &message).await
    }

    async fn broadcast_changes(&self, group_name: &str, changes: &ChangeSet) -> SyncResult<()> {
        let group_id = self.group_id(group_name).await?;
        let key = self
            .groups()
            .get_group_key(group_name)
            .await
            .ok_or_else(|| SyncError::MissingGroupKey(group_name.to_string()))?;

        let message = GroupMessage::Changes { changes: changes.as_str().to_string() };
        let group_message = self.codec.seal_for_group(&encode(&message)?, &group_id, &key)?;

        self.send_upstream(&UpstreamMessage::ForwardToGroup { group_id, group_message }, None)
            .await
    }

    async fn send_to_peer(&self, peer_email: &str, message: &PeerMessage) -> SyncResult<()> {
        let peer_message = self.codec.wrap_for_peer(&encode(message)?, peer_email).await?;
        let forward = UpstreamMessage::ForwardToPeer { peer_email: peer_email.to_string(), peer_message };
        self.send_upstream(&forward, None).await
    }

    async fn send_request(&self, kind: RequestKind, message: UpstreamMessage) -> SyncResult<RequestHandle> {
        let handle = self.requests().register(kind).await;

        if let Err(e) = self.send_upstream(&message, Some(handle.request_id().to_string())).await {
            self.requests().cancel(handle.request_id()).await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn send_upstream(&self, message: &UpstreamMessage, request_id: Option<String>) -> SyncResult<()> {
        let envelope = self.codec.wrap_for_server(&encode(message)?, request_id)?;
        self.transport.send(envelope, &self.server.address).await?;

        record_counter(metrics::MESSAGES_SENT, 1);
        debug!(kind = message.kind(), "Sent upstream message");
        Ok(())
    }
}

fn request_kind(message: &DownstreamMessage) -> Option<RequestKind> {
    match message {
        DownstreamMessage::RegisterPublicKeyResponse { .. } => Some(RequestKind::RegisterPublicKey),
        DownstreamMessage::CreateGroupResponse { .. } => Some(RequestKind::CreateGroup),
        DownstreamMessage::AddPeerToGroupResponse { .. } => Some(RequestKind::AddPeerToGroup),
        DownstreamMessage::RemovePeerFromGroupResponse { .. } => Some(RequestKind::RemovePeerFromGroup),
        DownstreamMessage::GetNotificationKeyResponse { .. } => Some(RequestKind::GetNotificationKey),
        _ => None,
    }
}
