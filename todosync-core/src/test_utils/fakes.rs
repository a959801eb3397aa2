//! Stand-ins for the relay server and the push channel

use super::fixtures::{provider, SERVER_KEY_INDEX};
use crate::core_contacts::AddressBook;
use crate::core_crypto::{public_key_to_string, CryptoProvider, PublicKey};
use crate::core_envelope::{Envelope, EnvelopeCodec};
use crate::core_protocol::{decode, encode, DownstreamMessage, MemberInfo, UpstreamMessage};
use crate::core_sync::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transport that keeps everything it is asked to send
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Envelope, String)>>,
    unreachable: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Drain the recorded envelopes
    pub async fn take(&self) -> Vec<Envelope> {
        self.sent.lock().await.drain(..).map(|(envelope, _)| envelope).collect()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Request id of the most recent envelope that carried one
    pub async fn last_request_id(&self) -> Option<String> {
        self.sent.lock().await.iter().rev().find_map(|(envelope, _)| envelope.request_id.clone())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, envelope: Envelope, destination: &str) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(destination.to_string()));
        }
        self.sent.lock().await.push((envelope, destination.to_string()));
        Ok(())
    }
}

/// Server side of the envelope protocol, driven by hand from tests
pub struct FakeServer {
    crypto: Arc<CryptoProvider>,
    codec: EnvelopeCodec,
    devices: Arc<AddressBook>,
}

pub const SERVER_EMAIL: &str = "server@todosync.test";

impl FakeServer {
    pub fn new() -> Self {
        let crypto = Arc::new(provider(SERVER_KEY_INDEX));
        let devices = Arc::new(AddressBook::new());
        let codec = EnvelopeCodec::new(
            SERVER_EMAIL,
            crypto.clone(),
            devices.clone(),
            crypto.public_key().clone(),
        );
        Self { crypto, codec, devices }
    }

    pub fn public_key(&self) -> PublicKey {
        self.crypto.public_key().clone()
    }

    pub async fn register_device(&self, email: &str, public_key: PublicKey) {
        self.devices.add_contact(email, &format!("token-{email}"), public_key).await;
    }

    pub async fn member_info(&self, email: &str) -> MemberInfo {
        let contact = self.devices.get_contact(email).await.expect("device registered");
        MemberInfo {
            email: email.to_string(),
            token: contact.token,
            public_key: public_key_to_string(&contact.public_key).expect("encodable key"),
        }
    }

    /// Wrap a downstream message for `to`
    pub async fn downstream(&self, to: &str, message: &DownstreamMessage) -> Envelope {
        let key = self.devices.get_contact_key(to).await.expect("device registered");
        let request_id = message.response_status().map(|(id, _)| id.to_string());
        self.codec
            .wrap_for_key(&encode(message).expect("encodable"), &key, request_id)
            .expect("wrap")
    }

    /// Authenticate and decode an upstream envelope from `from`
    pub async fn open_upstream(&self, from: &str, envelope: &Envelope) -> UpstreamMessage {
        let key = self.devices.get_contact_key(from).await.expect("device registered");
        decode(&self.codec.unwrap(envelope, &key).expect("valid upstream envelope")).expect("upstream message")
    }

    /// Turn a device's upstream `forward_*` into the envelope `to` would see
    ///
    /// Returns `None` for other upstream kinds or a peer forward addressed
    /// to someone else.
    pub async fn relay_to(&self, from: &str, envelope: &Envelope, to: &str) -> Option<Envelope> {
        let message = match self.open_upstream(from, envelope).await {
            UpstreamMessage::ForwardToPeer { peer_email, peer_message } if peer_email == to => {
                DownstreamMessage::ForwardToPeer { peer_message }
            }
            UpstreamMessage::ForwardToGroup { group_message, .. } => {
                DownstreamMessage::ForwardToGroup { group_message }
            }
            _ => return None,
        };
        Some(self.downstream(to, &message).await)
    }
}
