//! Cryptographic primitives
//!
//! - AES-256-GCM for message bodies and group documents
//! - RSA-OAEP (SHA-256) for wrapping per-message keys
//! - RSA-PSS (SHA-256) signatures over ciphertext

pub mod asymmetric;
pub mod errors;
pub mod provider;
pub mod signing;
pub mod symmetric;

pub use asymmetric::{
    decrypt_asymmetric, encrypt_asymmetric, generate_asymmetric_keypair, private_key_to_string,
    public_key_to_string, string_to_private_key, string_to_public_key, PrivateKey, PublicKey,
};
pub use errors::{CryptoError, CryptoResult};
pub use provider::CryptoProvider;
pub use signing::{sha256, sign, verify};
pub use symmetric::{
    decrypt_symmetric, encrypt_symmetric, generate_symmetric_key, key_to_string,
    string_to_symmetric_key, SymmetricKey,
};
