//! Address Book
//!
//! Maps a peer's email to the push token and public key learned from the
//! server. A contact is replaced wholesale on update, except for
//! [`AddressBook::update_token`] which keeps the known key.

use crate::core_crypto::PublicKey;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct UserContact {
    /// Push-notification token of the peer's device
    pub token: String,
    pub public_key: PublicKey,
}

#[derive(Default)]
pub struct AddressBook {
    contacts: RwLock<HashMap<String, UserContact>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a contact
    pub async fn add_contact(&self, email: &str, token: &str, public_key: PublicKey) {
        let contact = UserContact { token: token.to_string(), public_key };
        let previous = self.contacts.write().await.insert(email.to_string(), contact);

        if previous.is_some() {
            warn!(peer = %email, "Replacing existing contact");
        } else {
            debug!(peer = %email, "Added contact");
        }
    }

    pub async fn get_contact_key(&self, email: &str) -> Option<PublicKey> {
        let key = self.contacts.read().await.get(email).map(|c| c.public_key.clone());
        if key.is_none() {
            error!(peer = %email, "No public key for contact");
        }
        key
    }

    pub async fn get_contact(&self, email: &str) -> Option<UserContact> {
        self.contacts.read().await.get(email).cloned()
    }

    pub async fn remove_contact(&self, email: &str) -> bool {
        self.contacts.write().await.remove(email).is_some()
    }

    /// Replace the push token, keeping the known public key
    pub async fn update_token(&self, email: &str, token: &str) -> bool {
        match self.contacts.write().await.get_mut(email) {
            Some(contact) => {
                contact.token = token.to_string();
                true
            }
            None => {
                error!(peer = %email, "Cannot update token of unknown contact");
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.contacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contacts.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::keypair;

    #[tokio::test]
    async fn test_add_and_lookup() {
        let book = AddressBook::new();
        let (key, _) = keypair(0);

        book.add_contact("bob@example.com", "tok-1", key.clone()).await;

        assert_eq!(book.get_contact_key("bob@example.com").await, Some(key));
        assert_eq!(book.get_contact("bob@example.com").await.unwrap().token, "tok-1");
        assert!(book.get_contact_key("carol@example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_add_replaces_wholesale() {
        let book = AddressBook::new();
        let (first, _) = keypair(0);
        let (second, _) = keypair(1);

        book.add_contact("bob@example.com", "tok-1", first).await;
        book.add_contact("bob@example.com", "tok-2", second.clone()).await;

        let contact = book.get_contact("bob@example.com").await.unwrap();
        assert_eq!(contact, UserContact { token: "tok-2".to_string(), public_key: second });
        assert_eq!(book.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_token_preserves_key() {
        let book = AddressBook::new();
        let (key, _) = keypair(0);
        book.add_contact("bob@example.com", "tok-1", key.clone()).await;

        assert!(book.update_token("bob@example.com", "tok-9").await);
        assert!(!book.update_token("nobody@example.com", "tok-9").await);

        let contact = book.get_contact("bob@example.com").await.unwrap();
        assert_eq!(contact.token, "tok-9");
        assert_eq!(contact.public_key, key);
        assert_eq!(book.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_contact() {
        let book = AddressBook::new();
        book.add_contact("bob@example.com", "tok", keypair(0).0).await;

        assert!(book.remove_contact("bob@example.com").await);
        assert!(!book.remove_contact("bob@example.com").await);
        assert!(book.is_empty().await);
    }
}
