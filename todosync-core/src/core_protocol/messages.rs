/*
    messages.rs - typed payloads carried inside envelopes

    Every payload is a JSON object tagged by its kind:

    ```json
    { "upstream_type": "create_group", "group_name": "Groceries", "group_id": "g1", "member_emails": [] }
    { "downstream_type": "added_to_group", "group_name": "Groceries", "group_id": "g1", "members": [...] }
    { "peer_type": "document_init", "group_id": "g1", "group_name": "Groceries", "document": "<snapshot>" }
    { "group_type": "changes", "changes": "<change-set>" }
    ```

    Upstream goes device -> server, downstream server -> device. Peer
    messages ride inside forward_to_peer, group messages inside
    forward_to_group.
*/

use crate::core_envelope::{Envelope, GroupEnvelope};
use crate::core_group::Snapshot;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A group member as announced by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub email: String,
    pub token: String,
    /// Base64 SPKI DER
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "upstream_type", rename_all = "snake_case")]
pub enum UpstreamMessage {
    RegisterPublicKey {
        email: String,
        public_key: String,
    },
    CreateGroup {
        group_name: String,
        group_id: String,
        member_emails: Vec<String>,
    },
    AddPeerToGroup {
        group_name: String,
        group_id: String,
        peer_email: String,
    },
    RemovePeerFromGroup {
        group_name: String,
        group_id: String,
        peer_email: String,
    },
    GetNotificationKey {
        email: String,
    },
    ForwardToPeer {
        peer_email: String,
        peer_message: Envelope,
    },
    ForwardToGroup {
        group_id: String,
        group_message: GroupEnvelope,
    },
}

impl UpstreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamMessage::RegisterPublicKey { .. } => "register_public_key",
            UpstreamMessage::CreateGroup { .. } => "create_group",
            UpstreamMessage::AddPeerToGroup { .. } => "add_peer_to_group",
            UpstreamMessage::RemovePeerFromGroup { .. } => "remove_peer_from_group",
            UpstreamMessage::GetNotificationKey { .. } => "get_notification_key",
            UpstreamMessage::ForwardToPeer { .. } => "forward_to_peer",
            UpstreamMessage::ForwardToGroup { .. } => "forward_to_group",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "downstream_type", rename_all = "snake_case")]
pub enum DownstreamMessage {
    /// This device was made a member of a group
    AddedToGroup {
        group_name: String,
        group_id: String,
        members: Vec<MemberInfo>,
    },
    /// Someone else joined a group we are in
    AddedPeerToGroup {
        group_name: String,
        peer_email: String,
        peer_token: String,
        peer_public_key: String,
    },
    RemovedPeerFromGroup {
        group_name: String,
        peer_email: String,
    },
    ForwardToPeer {
        peer_message: Envelope,
    },
    ForwardToGroup {
        group_message: GroupEnvelope,
    },
    RegisterPublicKeyResponse {
        success: bool,
        request_id: String,
    },
    CreateGroupResponse {
        success: bool,
        request_id: String,
        group_name: String,
        group_id: String,
        #[serde(default)]
        members: Vec<MemberInfo>,
    },
    AddPeerToGroupResponse {
        success: bool,
        request_id: String,
        group_name: String,
        #[serde(default)]
        peer: Option<MemberInfo>,
    },
    RemovePeerFromGroupResponse {
        success: bool,
        request_id: String,
        group_name: String,
        peer_email: String,
    },
    GetNotificationKeyResponse {
        success: bool,
        request_id: String,
        email: String,
        #[serde(default)]
        notification_key: Option<String>,
    },
}

impl DownstreamMessage {
    /// Correlation id and outcome, for response kinds only
    pub fn response_status(&self) -> Option<(&str, bool)> {
        match self {
            DownstreamMessage::RegisterPublicKeyResponse { success, request_id }
            | DownstreamMessage::CreateGroupResponse { success, request_id, .. }
            | DownstreamMessage::AddPeerToGroupResponse { success, request_id, .. }
            | DownstreamMessage::RemovePeerFromGroupResponse { success, request_id, .. }
            | DownstreamMessage::GetNotificationKeyResponse { success, request_id, .. } => {
                Some((request_id.as_str(), *success))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DownstreamMessage::AddedToGroup { .. } => "added_to_group",
            DownstreamMessage::AddedPeerToGroup { .. } => "added_peer_to_group",
            DownstreamMessage::RemovedPeerFromGroup { .. } => "removed_peer_from_group",
            DownstreamMessage::ForwardToPeer { .. } => "forward_to_peer",
            DownstreamMessage::ForwardToGroup { .. } => "forward_to_group",
            DownstreamMessage::RegisterPublicKeyResponse { .. } => "register_public_key_response",
            DownstreamMessage::CreateGroupResponse { .. } => "create_group_response",
            DownstreamMessage::AddPeerToGroupResponse { .. } => "add_peer_to_group_response",
            DownstreamMessage::RemovePeerFromGroupResponse { .. } => "remove_peer_from_group_response",
            DownstreamMessage::GetNotificationKeyResponse { .. } => "get_notification_key_response",
        }
    }
}

/// Device-to-device messages relayed through `forward_to_peer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "peer_type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Shared group key, base64
    GroupKey {
        group_id: String,
        group_name: String,
        key: String,
    },
    /// Full document for a newly joined member to merge
    DocumentInit {
        group_id: String,
        group_name: String,
        document: Snapshot,
    },
    Changes {
        group_id: String,
        group_name: String,
        changes: String,
    },
}

impl PeerMessage {
    pub fn group_id(&self) -> &str {
        match self {
            PeerMessage::GroupKey { group_id, .. }
            | PeerMessage::DocumentInit { group_id, .. }
            | PeerMessage::Changes { group_id, .. } => group_id,
        }
    }

    pub fn group_name(&self) -> &str {
        match self {
            PeerMessage::GroupKey { group_name, .. }
            | PeerMessage::DocumentInit { group_name, .. }
            | PeerMessage::Changes { group_name, .. } => group_name,
        }
    }
}

/// Group-wide messages sealed under the group key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "group_type", rename_all = "snake_case")]
pub enum GroupMessage {
    Changes { changes: String },
}

pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn decode<T: DeserializeOwned>(payload: &str) -> serde_json::Result<T> {
    serde_json::from_str(payload)
}
