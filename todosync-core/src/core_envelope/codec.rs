/*
    codec.rs - Message Envelope Codec

    Every message leaving the device is wrapped as:

        enc_message = AES-GCM(payload, K)          K fresh per message
        enc_key     = RSA-OAEP(K, recipient public key)
        signature   = RSA-PSS(enc_message, sender private key)

    Unwrapping checks the signature against the key we already trust for
    the claimed sender before touching the ciphertext.

    Group traffic uses the shared group key instead of a per-message key,
    so a GroupEnvelope carries no enc_key.
*/

use super::errors::{CodecError, CodecResult};
use crate::core_contacts::AddressBook;
use crate::core_crypto::{
    decrypt_symmetric, encrypt_asymmetric, encrypt_symmetric, generate_symmetric_key,
    key_to_string, string_to_symmetric_key, verify, CryptoProvider, PublicKey, SymmetricKey,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wire envelope for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub enc_message: String,
    pub enc_key: String,
    pub sender_email: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Wire envelope sealed under a group key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEnvelope {
    pub group_id: String,
    pub enc_message: String,
    pub sender_email: String,
    pub signature: String,
}

pub struct EnvelopeCodec {
    own_email: String,
    crypto: Arc<CryptoProvider>,
    contacts: Arc<AddressBook>,
    server_public_key: PublicKey,
}

impl EnvelopeCodec {
    pub fn new(
        own_email: impl Into<String>,
        crypto: Arc<CryptoProvider>,
        contacts: Arc<AddressBook>,
        server_public_key: PublicKey,
    ) -> Self {
        Self { own_email: own_email.into(), crypto, contacts, server_public_key }
    }

    pub fn own_email(&self) -> &str {
        &self.own_email
    }

    pub fn server_public_key(&self) -> &PublicKey {
        &self.server_public_key
    }

    pub fn wrap_for_server(&self, payload: &str, request_id: Option<String>) -> CodecResult<Envelope> {
        self.wrap_for_key(payload, &self.server_public_key, request_id)
    }

    pub async fn wrap_for_peer(&self, payload: &str, peer_email: &str) -> CodecResult<Envelope> {
        let peer_key = self
            .contacts
            .get_contact_key(peer_email)
            .await
            .ok_or_else(|| CodecError::UnknownContact(peer_email.to_string()))?;
        self.wrap_for_key(payload, &peer_key, None)
    }

    /// Wrap `payload` so that only the holder of `recipient_key` can read it
    pub fn wrap_for_key(
        &self,
        payload: &str,
        recipient_key: &PublicKey,
        request_id: Option<String>,
    ) -> CodecResult<Envelope> {
        let message_key = generate_symmetric_key();
        let enc_message = encrypt_symmetric(payload, &message_key)?;
        let enc_key = encrypt_asymmetric(&key_to_string(&message_key), recipient_key)
            .ok_or(CodecError::KeyWrap("wrapped"))?;
        let signature = self.crypto.sign(&enc_message)?;

        Ok(Envelope {
            enc_message,
            enc_key,
            sender_email: self.own_email.clone(),
            signature,
            request_id,
        })
    }

    /// Authenticate and decrypt an envelope addressed to this device
    pub fn unwrap(&self, envelope: &Envelope, expected_sender_key: &PublicKey) -> CodecResult<String> {
        if !verify(&envelope.signature, &envelope.enc_message, expected_sender_key) {
            warn!(sender = %envelope.sender_email, "Rejected envelope with bad signature");
            return Err(CodecError::AuthenticationFailed(envelope.sender_email.clone()));
        }

        let key_string = self
            .crypto
            .decrypt_with_own_key(&envelope.enc_key)
            .ok_or(CodecError::KeyWrap("unwrapped"))?;
        let message_key = string_to_symmetric_key(&key_string)?;

        let payload = decrypt_symmetric(&envelope.enc_message, &message_key)?;
        debug!(sender = %envelope.sender_email, "Unwrapped envelope");
        Ok(payload)
    }

    pub fn seal_for_group(
        &self,
        payload: &str,
        group_id: &str,
        group_key: &SymmetricKey,
    ) -> CodecResult<GroupEnvelope> {
        let enc_message = encrypt_symmetric(payload, group_key)?;
        let signature = self.crypto.sign(&enc_message)?;

        Ok(GroupEnvelope {
            group_id: group_id.to_string(),
            enc_message,
            sender_email: self.own_email.clone(),
            signature,
        })
    }

    pub fn open_group(
        &self,
        envelope: &GroupEnvelope,
        group_key: &SymmetricKey,
        sender_key: &PublicKey,
    ) -> CodecResult<String> {
        if !verify(&envelope.signature, &envelope.enc_message, sender_key) {
            warn!(
                sender = %envelope.sender_email,
                group_id = %envelope.group_id,
                "Rejected group message with bad signature"
            );
            return Err(CodecError::AuthenticationFailed(envelope.sender_email.clone()));
        }

        Ok(decrypt_symmetric(&envelope.enc_message, group_key)?)
    }
}
