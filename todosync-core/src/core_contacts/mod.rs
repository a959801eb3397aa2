//! Peer contacts: push token and public key per email

pub mod address_book;

pub use address_book::{AddressBook, UserContact};
