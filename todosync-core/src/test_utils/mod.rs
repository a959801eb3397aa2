//! Test utilities shared by the unit and scenario tests
//!
//! RSA key generation is slow, so every test draws identities from the
//! same small pool of pre-generated keys.

pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeServer, RecordingTransport};
pub use fixtures::{keypair, provider, SERVER_KEY_INDEX};
