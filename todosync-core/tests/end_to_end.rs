//! Several devices syncing one card list through the in-memory relay
//!
//! Inboxes are drained by hand so each test decides delivery order.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use todosync_core::config::SyncConfig;
use todosync_core::core_crypto::{generate_asymmetric_keypair, CryptoProvider, PrivateKey};
use todosync_core::core_envelope::Envelope;
use todosync_core::core_protocol::RequestOutcome;
use todosync_core::core_sync::adapters::memory_relay::RELAY_EMAIL;
use todosync_core::core_sync::adapters::{MemoryRelay, RelayTransport, TodoListEngine};
use todosync_core::core_sync::{
    Card, Identity, InboundOutcome, ServerEndpoint, SyncEngine, SyncServices,
};
use tokio::sync::mpsc::UnboundedReceiver;

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";
const CAROL: &str = "carol@example.com";

fn identity(index: usize) -> CryptoProvider {
    static KEYS: OnceLock<Vec<PrivateKey>> = OnceLock::new();
    let keys = KEYS.get_or_init(|| {
        (0..4).map(|_| generate_asymmetric_keypair(1024).unwrap().1).collect()
    });
    CryptoProvider::from_private_key(keys[index].clone())
}

fn relay() -> Arc<MemoryRelay> {
    MemoryRelay::new(identity(3))
}

struct Device {
    email: &'static str,
    engine: SyncEngine<TodoListEngine, RelayTransport>,
    inbox: UnboundedReceiver<Envelope>,
}

impl Device {
    async fn join(relay: &Arc<MemoryRelay>, index: usize, email: &'static str) -> Self {
        let crypto = Arc::new(identity(index));
        let (transport, inbox) =
            relay.connect(email, &format!("token-{email}"), crypto.public_key().clone()).await;

        let engine = SyncEngine::new(
            Identity::new(email, crypto),
            ServerEndpoint { address: RELAY_EMAIL.to_string(), public_key: relay.public_key().clone() },
            SyncServices::new(&SyncConfig::default()),
            Arc::new(TodoListEngine::new(email)),
            Arc::new(transport),
        );
        Self { email, engine, inbox }
    }

    fn pending(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(envelope) = self.inbox.try_recv() {
            envelopes.push(envelope);
        }
        envelopes
    }

    async fn process(&mut self) -> Vec<InboundOutcome> {
        let mut outcomes = Vec::new();
        for envelope in self.pending() {
            outcomes.push(self.engine.handle_inbound(envelope).await);
        }
        outcomes
    }

    async fn cards(&self, group: &str) -> Vec<Card> {
        self.engine.cards(group).await.unwrap()
    }
}

/// Deliver until every inbox is empty, failing on any dropped message
async fn settle(devices: &mut [&mut Device]) {
    loop {
        let mut delivered = 0;
        for device in devices.iter_mut() {
            let outcomes = device.process().await;
            assert!(
                outcomes.iter().all(InboundOutcome::is_handled),
                "{} dropped messages: {:?}",
                device.email,
                outcomes
            );
            delivered += outcomes.len();
        }
        if delivered == 0 {
            break;
        }
    }
}

fn titles(cards: &[Card]) -> Vec<&str> {
    cards.iter().map(|c| c.title.as_str()).collect()
}

#[tokio::test]
async fn test_three_devices_converge() {
    let relay = relay();
    let mut alice = Device::join(&relay, 0, ALICE).await;
    let mut bob = Device::join(&relay, 1, BOB).await;
    let mut carol = Device::join(&relay, 2, CAROL).await;

    let handle = alice.engine.create_group("Groceries", &[BOB, CAROL]).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;
    assert_eq!(handle.wait().await, RequestOutcome::Completed { success: true });

    alice.engine.add_card("Groceries", "milk").await.unwrap();
    bob.engine.add_card("Groceries", "bread").await.unwrap();
    carol.engine.add_card("Groceries", "eggs").await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    let expected = alice.cards("Groceries").await;
    assert_eq!(expected.len(), 3);
    assert_eq!(bob.cards("Groceries").await, expected);
    assert_eq!(carol.cards("Groceries").await, expected);

    bob.engine.set_card_completed("Groceries", 0, true).await.unwrap();
    carol.engine.remove_card("Groceries", 2).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    let final_cards = alice.cards("Groceries").await;
    assert_eq!(final_cards.len(), 2);
    assert!(final_cards[0].completed);
    assert_eq!(bob.cards("Groceries").await, final_cards);
    assert_eq!(carol.cards("Groceries").await, final_cards);
}

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let relay = relay();
    let mut alice = Device::join(&relay, 0, ALICE).await;
    let mut bob = Device::join(&relay, 1, BOB).await;
    let mut carol = Device::join(&relay, 2, CAROL).await;

    alice.engine.create_group("Groceries", &[BOB]).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;
    alice.engine.add_card("Groceries", "milk").await.unwrap();
    bob.engine.add_card("Groceries", "bread").await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    let handle = alice.engine.add_peer_to_group("Groceries", CAROL).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;
    assert_eq!(handle.wait().await, RequestOutcome::Completed { success: true });
    assert_eq!(titles(&carol.cards("Groceries").await), vec!["milk", "bread"]);

    carol.engine.add_card("Groceries", "eggs").await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    for device in [&alice, &bob, &carol] {
        assert_eq!(titles(&device.cards("Groceries").await), vec!["milk", "bread", "eggs"]);
    }
    assert!(bob.engine.groups().is_member("Groceries", CAROL).await);
}

#[tokio::test]
async fn test_removed_member_stops_receiving() {
    let relay = relay();
    let mut alice = Device::join(&relay, 0, ALICE).await;
    let mut bob = Device::join(&relay, 1, BOB).await;

    alice.engine.create_group("Groceries", &[BOB]).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    let group_id = alice.engine.groups().get_group_id("Groceries").await.unwrap();

    let handle = alice.engine.remove_peer_from_group("Groceries", BOB).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(handle.wait().await, RequestOutcome::Completed { success: true });

    assert!(!bob.engine.groups().contains("Groceries").await);
    assert!(!alice.engine.groups().is_member("Groceries", BOB).await);
    assert_eq!(relay.group_members(&group_id).await, Some(BTreeSet::from([ALICE.to_string()])));

    alice.engine.add_card("Groceries", "milk").await.unwrap();
    assert!(bob.pending().is_empty());
}

#[tokio::test]
async fn test_out_of_order_delivery_converges() {
    let relay = relay();
    let mut alice = Device::join(&relay, 0, ALICE).await;
    let mut bob = Device::join(&relay, 1, BOB).await;

    alice.engine.create_group("Groceries", &[BOB]).await.unwrap();
    alice.process().await;
    alice.engine.add_card("Groceries", "milk").await.unwrap();

    // added_to_group, group key, document init, changes
    let mut reordered = bob.pending();
    assert_eq!(reordered.len(), 4);
    reordered.swap(2, 3);

    for envelope in reordered {
        assert_eq!(bob.engine.handle_inbound(envelope).await, InboundOutcome::Handled);
    }

    assert_eq!(titles(&bob.cards("Groceries").await), vec!["milk"]);
    assert!(!bob.engine.buffers().has_pending().await);
}

#[tokio::test]
async fn test_server_requests_round_trip() {
    let relay = relay();
    let mut alice = Device::join(&relay, 0, ALICE).await;
    let mut bob = Device::join(&relay, 1, BOB).await;

    let registered = alice.engine.register_public_key().await.unwrap();
    alice.engine.create_group("Groceries", &[BOB]).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(registered.wait().await, RequestOutcome::Completed { success: true });

    let lookup = alice.engine.request_notification_key(BOB).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(lookup.wait().await, RequestOutcome::Completed { success: true });
    assert_eq!(alice.engine.contacts().get_contact(BOB).await.unwrap().token, format!("token-{BOB}"));

    let unknown = alice.engine.request_notification_key("nobody@example.com").await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(unknown.wait().await, RequestOutcome::Completed { success: false });
}
