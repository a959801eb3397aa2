/*
    memory_relay.rs - in-process relay server

    Implements the server side of the wire contract for tests and demos:

    - keeps the device registry (email -> public key, push token, inbox)
    - keeps the group registry (group_id -> name, members)
    - answers create/add/remove/notification-key/register requests
    - fans forward_to_peer / forward_to_group out to device inboxes

    Every downstream payload is wrapped for its recipient and signed with
    the relay's own key, exactly like the real server. Inboxes are plain
    unbounded channels; the owner of the receiving end decides when (and
    in which order) envelopes reach `SyncEngine::handle_inbound`.
*/

use crate::core_contacts::AddressBook;
use crate::core_crypto::{public_key_to_string, string_to_public_key, CryptoProvider, PublicKey};
use crate::core_envelope::{Envelope, EnvelopeCodec};
use crate::core_protocol::{decode, encode, DownstreamMessage, MemberInfo, UpstreamMessage};
use crate::core_sync::errors::TransportError;
use crate::core_sync::transport::Transport;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub const RELAY_EMAIL: &str = "relay@todosync.local";

struct Device {
    public_key: PublicKey,
    token: String,
    inbox: mpsc::UnboundedSender<Envelope>,
}

struct RelayGroup {
    name: String,
    members: BTreeSet<String>,
}

#[derive(Default)]
struct RelayState {
    devices: HashMap<String, Device>,
    groups: HashMap<String, RelayGroup>,
}

type Deliveries = Vec<(String, DownstreamMessage, Option<String>)>;

pub struct MemoryRelay {
    crypto: Arc<CryptoProvider>,
    codec: EnvelopeCodec,
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new(crypto: CryptoProvider) -> Arc<Self> {
        let crypto = Arc::new(crypto);
        let own_key = crypto.public_key().clone();
        let codec = EnvelopeCodec::new(RELAY_EMAIL, crypto.clone(), Arc::new(AddressBook::new()), own_key);
        Arc::new(Self { crypto, codec, state: Mutex::new(RelayState::default()) })
    }

    /// Key devices use to authenticate the relay
    pub fn public_key(&self) -> &PublicKey {
        self.crypto.public_key()
    }

    /// Register a device and open its inbox
    pub async fn connect(
        self: &Arc<Self>,
        email: &str,
        token: &str,
        public_key: PublicKey,
    ) -> (RelayTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let device = Device { public_key, token: token.to_string(), inbox };

        if self.state.lock().await.devices.insert(email.to_string(), device).is_some() {
            warn!(device = %email, "Device reconnected, previous inbox closed");
        }
        info!(device = %email, "Device connected to relay");

        (RelayTransport { relay: self.clone(), email: email.to_string() }, rx)
    }

    pub async fn group_members(&self, group_id: &str) -> Option<BTreeSet<String>> {
        self.state.lock().await.groups.get(group_id).map(|g| g.members.clone())
    }

    /// Process one upstream envelope from `from`
    pub async fn handle_upstream(&self, from: &str, envelope: Envelope) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        if envelope.sender_email != from {
            return Err(TransportError::Rejected(format!(
                "{} cannot send as {}",
                from, envelope.sender_email
            )));
        }
        let sender_key = state
            .devices
            .get(from)
            .map(|d| d.public_key.clone())
            .ok_or_else(|| TransportError::Unreachable(format!("unknown device {}", from)))?;

        let payload = self
            .codec
            .unwrap(&envelope, &sender_key)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let message: UpstreamMessage =
            decode(&payload).map_err(|e| TransportError::Rejected(e.to_string()))?;
        let request_id = envelope.request_id.unwrap_or_default();

        debug!(device = %from, kind = message.kind(), "Relay received upstream message");
        let deliveries = process(&mut state, from, request_id, message)?;

        for (recipient, message, request_id) in deliveries {
            self.deliver(&state, &recipient, &message, request_id)?;
        }
        Ok(())
    }

    fn deliver(
        &self,
        state: &RelayState,
        recipient: &str,
        message: &DownstreamMessage,
        request_id: Option<String>,
    ) -> Result<(), TransportError> {
        let Some(device) = state.devices.get(recipient) else {
            warn!(device = %recipient, kind = message.kind(), "Dropping message for unknown device");
            return Ok(());
        };

        let payload = encode(message).map_err(|e| TransportError::Rejected(e.to_string()))?;
        let envelope = self
            .codec
            .wrap_for_key(&payload, &device.public_key, request_id)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        if device.inbox.send(envelope).is_err() {
            warn!(device = %recipient, "Inbox closed, message lost");
        }
        Ok(())
    }
}

fn member_info(state: &RelayState, email: &str) -> Result<Option<MemberInfo>, TransportError> {
    let Some(device) = state.devices.get(email) else {
        return Ok(None);
    };
    let public_key =
        public_key_to_string(&device.public_key).map_err(|e| TransportError::Rejected(e.to_string()))?;
    Ok(Some(MemberInfo { email: email.to_string(), token: device.token.clone(), public_key }))
}

fn member_infos<'a>(
    state: &RelayState,
    emails: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<MemberInfo>, TransportError> {
    let mut infos = Vec::new();
    for email in emails {
        if let Some(info) = member_info(state, email)? {
            infos.push(info);
        }
    }
    Ok(infos)
}

fn process(
    state: &mut RelayState,
    sender: &str,
    request_id: String,
    message: UpstreamMessage,
) -> Result<Deliveries, TransportError> {
    let mut out: Deliveries = Vec::new();
    let reply = Some(request_id.clone());

    match message {
        UpstreamMessage::RegisterPublicKey { email, public_key } => {
            let parsed = string_to_public_key(&public_key).ok();
            let success = match (email == sender, parsed, state.devices.get_mut(sender)) {
                (true, Some(key), Some(device)) => {
                    device.public_key = key;
                    true
                }
                _ => false,
            };
            out.push((
                sender.to_string(),
                DownstreamMessage::RegisterPublicKeyResponse { success, request_id },
                reply,
            ));
        }

        UpstreamMessage::CreateGroup { group_name, group_id, member_emails } => {
            if state.groups.contains_key(&group_id) {
                out.push((
                    sender.to_string(),
                    DownstreamMessage::CreateGroupResponse {
                        success: false,
                        request_id,
                        group_name,
                        group_id,
                        members: Vec::new(),
                    },
                    reply,
                ));
                return Ok(out);
            }

            let invited: BTreeSet<String> = member_emails
                .into_iter()
                .filter(|email| email != sender)
                .filter(|email| {
                    let known = state.devices.contains_key(email);
                    if !known {
                        warn!(peer = %email, "Skipping unregistered invitee");
                    }
                    known
                })
                .collect();

            let mut members = invited.clone();
            members.insert(sender.to_string());

            for invitee in &invited {
                let others = members.iter().filter(|m| *m != invitee);
                out.push((
                    invitee.clone(),
                    DownstreamMessage::AddedToGroup {
                        group_name: group_name.clone(),
                        group_id: group_id.clone(),
                        members: member_infos(state, others)?,
                    },
                    None,
                ));
            }
            out.push((
                sender.to_string(),
                DownstreamMessage::CreateGroupResponse {
                    success: true,
                    request_id,
                    group_name: group_name.clone(),
                    group_id: group_id.clone(),
                    members: member_infos(state, &invited)?,
                },
                reply,
            ));

            info!(group_id = %group_id, members = members.len(), "Relay created group");
            state.groups.insert(group_id, RelayGroup { name: group_name, members });
        }

        UpstreamMessage::AddPeerToGroup { group_name, group_id, peer_email } => {
            let peer = member_info(state, &peer_email)?;
            let allowed = state
                .groups
                .get(&group_id)
                .map(|g| g.members.contains(sender) && !g.members.contains(&peer_email))
                .unwrap_or(false);

            let (Some(peer), true) = (peer, allowed) else {
                out.push((
                    sender.to_string(),
                    DownstreamMessage::AddPeerToGroupResponse {
                        success: false,
                        request_id,
                        group_name,
                        peer: None,
                    },
                    reply,
                ));
                return Ok(out);
            };

            let Some(group) = state.groups.get(&group_id) else {
                return Ok(out);
            };
            let existing = group.members.clone();
            let name = group.name.clone();

            out.push((
                peer_email.clone(),
                DownstreamMessage::AddedToGroup {
                    group_name: name.clone(),
                    group_id: group_id.clone(),
                    members: member_infos(state, &existing)?,
                },
                None,
            ));
            for member in existing.iter().filter(|m| *m != sender) {
                out.push((
                    member.clone(),
                    DownstreamMessage::AddedPeerToGroup {
                        group_name: name.clone(),
                        peer_email: peer.email.clone(),
                        peer_token: peer.token.clone(),
                        peer_public_key: peer.public_key.clone(),
                    },
                    None,
                ));
            }
            out.push((
                sender.to_string(),
                DownstreamMessage::AddPeerToGroupResponse {
                    success: true,
                    request_id,
                    group_name,
                    peer: Some(peer),
                },
                reply,
            ));

            if let Some(group) = state.groups.get_mut(&group_id) {
                group.members.insert(peer_email);
            }
        }

        UpstreamMessage::RemovePeerFromGroup { group_name, group_id, peer_email } => {
            let removed = match state.groups.get_mut(&group_id) {
                Some(group) if group.members.contains(sender) => group
                    .members
                    .remove(&peer_email)
                    .then(|| (group.name.clone(), group.members.clone())),
                _ => None,
            };

            if let Some((name, remaining)) = &removed {
                let notify = remaining
                    .iter()
                    .filter(|m| m.as_str() != sender)
                    .chain(std::iter::once(&peer_email).filter(|p| p.as_str() != sender));
                for member in notify {
                    out.push((
                        member.clone(),
                        DownstreamMessage::RemovedPeerFromGroup {
                            group_name: name.clone(),
                            peer_email: peer_email.clone(),
                        },
                        None,
                    ));
                }
            }

            out.push((
                sender.to_string(),
                DownstreamMessage::RemovePeerFromGroupResponse {
                    success: removed.is_some(),
                    request_id,
                    group_name,
                    peer_email,
                },
                reply,
            ));
        }

        UpstreamMessage::GetNotificationKey { email } => {
            let notification_key = state.devices.get(&email).map(|d| d.token.clone());
            out.push((
                sender.to_string(),
                DownstreamMessage::GetNotificationKeyResponse {
                    success: notification_key.is_some(),
                    request_id,
                    email,
                    notification_key,
                },
                reply,
            ));
        }

        UpstreamMessage::ForwardToPeer { peer_email, peer_message } => {
            out.push((peer_email, DownstreamMessage::ForwardToPeer { peer_message }, None));
        }

        UpstreamMessage::ForwardToGroup { group_id, group_message } => {
            let Some(group) = state.groups.get(&group_id) else {
                warn!(group_id = %group_id, "Forward to unknown group");
                return Ok(out);
            };
            if !group.members.contains(sender) {
                return Err(TransportError::Rejected(format!(
                    "{} is not a member of {}",
                    sender, group_id
                )));
            }
            for member in group.members.iter().filter(|m| m.as_str() != sender) {
                out.push((
                    member.clone(),
                    DownstreamMessage::ForwardToGroup { group_message: group_message.clone() },
                    None,
                ));
            }
        }
    }

    Ok(out)
}

/// A device's upstream connection to a [`MemoryRelay`]
#[derive(Clone)]
pub struct RelayTransport {
    relay: Arc<MemoryRelay>,
    email: String,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, envelope: Envelope, _destination: &str) -> Result<(), TransportError> {
        self.relay.handle_upstream(&self.email, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::provider;

    async fn device_codec(relay: &MemoryRelay, index: usize, email: &str) -> EnvelopeCodec {
        EnvelopeCodec::new(email, Arc::new(provider(index)), Arc::new(AddressBook::new()), relay.public_key().clone())
    }

    #[tokio::test]
    async fn test_create_group_notifies_invitees() {
        let relay = MemoryRelay::new(provider(5));
        let (alice_tx, mut alice_rx) = relay.connect("alice@example.com", "tok-a", provider(0).public_key().clone()).await;
        let (_bob_tx, mut bob_rx) = relay.connect("bob@example.com", "tok-b", provider(1).public_key().clone()).await;

        let alice = device_codec(&relay, 0, "alice@example.com").await;
        let bob = device_codec(&relay, 1, "bob@example.com").await;

        let create = UpstreamMessage::CreateGroup {
            group_name: "Groceries".to_string(),
            group_id: "g1".to_string(),
            member_emails: vec!["bob@example.com".to_string(), "ghost@example.com".to_string()],
        };
        let envelope = alice.wrap_for_server(&encode(&create).unwrap(), Some("r1".to_string())).unwrap();
        alice_tx.send(envelope, "relay").await.unwrap();

        let to_bob = bob_rx.try_recv().unwrap();
        let added: DownstreamMessage = decode(&bob.unwrap(&to_bob, relay.public_key()).unwrap()).unwrap();
        match added {
            DownstreamMessage::AddedToGroup { group_id, members, .. } => {
                assert_eq!(group_id, "g1");
                assert_eq!(members.iter().map(|m| m.email.as_str()).collect::<Vec<_>>(), vec!["alice@example.com"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let to_alice = alice_rx.try_recv().unwrap();
        assert_eq!(to_alice.request_id.as_deref(), Some("r1"));
        let response: DownstreamMessage = decode(&alice.unwrap(&to_alice, relay.public_key()).unwrap()).unwrap();
        assert_eq!(response.response_status(), Some(("r1", true)));

        let members = relay.group_members("g1").await.unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_impersonation_rejected() {
        let relay = MemoryRelay::new(provider(5));
        let (mallory_tx, _rx) = relay.connect("mallory@example.com", "tok-m", provider(3).public_key().clone()).await;
        relay.connect("alice@example.com", "tok-a", provider(0).public_key().clone()).await;

        // signed by mallory's key but claiming to be alice
        let forged = device_codec(&relay, 3, "alice@example.com").await;
        let lookup = UpstreamMessage::GetNotificationKey { email: "alice@example.com".to_string() };
        let envelope = forged.wrap_for_server(&encode(&lookup).unwrap(), None).unwrap();

        assert!(matches!(mallory_tx.send(envelope.clone(), "relay").await, Err(TransportError::Rejected(_))));
        assert!(matches!(
            relay.handle_upstream("alice@example.com", envelope).await,
            Err(TransportError::Rejected(_))
        ));
    }
}
