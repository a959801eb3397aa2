/*
    Scenario tests for core_sync

    Each device is a real SyncEngine with the reference CRDT engine and a
    recording transport. A FakeServer stands in for the relay so tests
    control exactly which message arrives when.
*/


use crate::config::SyncConfig;
use crate::core_contacts::AddressBook;
use crate::core_envelope::{Envelope, EnvelopeCodec};
use crate::core_protocol::{encode, DownstreamMessage, PeerMessage, RequestOutcome, UpstreamMessage};
use crate::core_sync::adapters::TodoListEngine;
use crate::core_sync::{Identity, InboundOutcome, ServerEndpoint, SyncEngine, SyncServices};
use crate::test_utils::{provider, FakeServer, RecordingTransport};
use std::sync::Arc;

pub(super) const ALICE: &str = "alice@example.com";
pub(super) const BOB: &str = "bob@example.com";
pub(super) const CAROL: &str = "carol@example.com";

pub(super) struct Device {
    pub email: &'static str,
    pub engine: SyncEngine<TodoListEngine, RecordingTransport>,
    pub transport: Arc<RecordingTransport>,
}

pub(super) async fn device(server: &FakeServer, index: usize, email: &'static str) -> Device {
    device_with_config(server, index, email, &SyncConfig::default()).await
}

pub(super) async fn device_with_config(
    server: &FakeServer,
    index: usize,
    email: &'static str,
    config: &SyncConfig,
) -> Device {
    let crypto = Arc::new(provider(index));
    server.register_device(email, crypto.public_key().clone()).await;

    let transport = Arc::new(RecordingTransport::new());
    let engine = SyncEngine::new(
        Identity::new(email, crypto),
        ServerEndpoint { address: "server".to_string(), public_key: server.public_key() },
        SyncServices::new(config),
        Arc::new(TodoListEngine::new(email)),
        transport.clone(),
    );
    Device { email, engine, transport }
}

/// Deliver everything `from` has sent that `to` should see
pub(super) async fn pump(server: &FakeServer, from: &Device, to: &Device) -> Vec<InboundOutcome> {
    let mut outcomes = Vec::new();
    for envelope in from.transport.take().await {
        if let Some(delivered) = server.relay_to(from.email, &envelope, to.email).await {
            outcomes.push(to.engine.handle_inbound(delivered).await);
        }
    }
    outcomes
}

/// Tell `invitee` it was added to a group
pub(super) async fn announce_membership(
    server: &FakeServer,
    invitee: &Device,
    group_name: &str,
    group_id: &str,
    others: &[&str],
) -> InboundOutcome {
    let mut members = Vec::new();
    for email in others {
        members.push(server.member_info(email).await);
    }
    let added = DownstreamMessage::AddedToGroup {
        group_name: group_name.to_string(),
        group_id: group_id.to_string(),
        members,
    };
    invitee.engine.handle_inbound(server.downstream(invitee.email, &added).await).await
}

/// A peer message from `from` (fixture key `from_index`) as the server would forward it to `to`
pub(super) async fn peer_envelope(
    server: &FakeServer,
    from_index: usize,
    from: &str,
    to: &str,
    message: &PeerMessage,
) -> Envelope {
    let book = Arc::new(AddressBook::new());
    let to_key = server.member_info(to).await.public_key;
    book.add_contact(to, "tok", crate::core_crypto::string_to_public_key(&to_key).unwrap()).await;

    let codec = EnvelopeCodec::new(from, Arc::new(provider(from_index)), book, server.public_key());
    let peer_message = codec.wrap_for_peer(&encode(message).unwrap(), to).await.unwrap();
    server.downstream(to, &DownstreamMessage::ForwardToPeer { peer_message }).await
}

/// Run `create_group` through the server, invitees first, and return the group id
///
/// Whatever the creator sends afterwards (keys, document) stays in its
/// transport for the test to deliver.
pub(super) async fn create_group(
    server: &FakeServer,
    creator: &Device,
    group_name: &str,
    invitees: &[&Device],
) -> String {
    let emails: Vec<&str> = invitees.iter().map(|d| d.email).collect();
    let handle = creator.engine.create_group(group_name, &emails).await.unwrap();

    let sent = creator.transport.take().await;
    assert_eq!(sent.len(), 1);
    let group_id = match server.open_upstream(creator.email, &sent[0]).await {
        UpstreamMessage::CreateGroup { group_id, .. } => group_id,
        other => panic!("expected create_group, got {:?}", other),
    };

    for invitee in invitees {
        let others: Vec<&str> = std::iter::once(creator.email)
            .chain(emails.iter().copied().filter(|e| *e != invitee.email))
            .collect();
        let outcome = announce_membership(server, invitee, group_name, &group_id, &others).await;
        assert_eq!(outcome, InboundOutcome::Handled);
    }

    let mut members = Vec::new();
    for email in &emails {
        members.push(server.member_info(email).await);
    }
    let response = DownstreamMessage::CreateGroupResponse {
        success: true,
        request_id: handle.request_id().to_string(),
        group_name: group_name.to_string(),
        group_id: group_id.clone(),
        members,
    };
    let outcome = creator.engine.handle_inbound(server.downstream(creator.email, &response).await).await;
    assert_eq!(outcome, InboundOutcome::Handled);
    assert_eq!(handle.wait().await, RequestOutcome::Completed { success: true });

    group_id
}

pub(super) fn titles(cards: &[crate::core_sync::Card]) -> Vec<&str> {
    cards.iter().map(|c| c.title.as_str()).collect()
}

/// Alice and Bob sharing an initialized "Groceries" group
pub(super) async fn active_pair(server: &FakeServer) -> (Device, Device, String) {
    let alice = device(server, 0, ALICE).await;
    let bob = device(server, 1, BOB).await;

    let group_id = create_group(server, &alice, "Groceries", &[&bob]).await;
    let outcomes = pump(server, &alice, &bob).await;
    assert!(outcomes.iter().all(InboundOutcome::is_handled), "{:?}", outcomes);

    (alice, bob, group_id)
}
