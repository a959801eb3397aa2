/*
    symmetric.rs - AES-256-GCM message encryption

    Wire format of a ciphertext string:

        base64( nonce[12] || ciphertext || tag[16] )

    A fresh nonce is drawn from the OS RNG for every call, so encrypting the
    same plaintext twice yields different strings.
*/

use super::errors::{CryptoError, CryptoResult};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// 256-bit AES key, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Generate a fresh group or message key
pub fn generate_symmetric_key() -> SymmetricKey {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(key.as_slice());
    SymmetricKey(bytes)
}

pub fn encrypt_symmetric(plaintext: &str, key: &SymmetricKey) -> CryptoResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut framed = nonce_bytes.to_vec();
    framed.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(framed))
}

pub fn decrypt_symmetric(ciphertext: &str, key: &SymmetricKey) -> CryptoResult<String> {
    let framed = STANDARD.decode(ciphertext)?;
    if framed.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionFailed("Invalid ciphertext length".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let (nonce, body) = framed.split_at(NONCE_LEN);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    Ok(String::from_utf8(plaintext)?)
}

pub fn key_to_string(key: &SymmetricKey) -> String {
    STANDARD.encode(key.as_bytes())
}

pub fn string_to_symmetric_key(encoded: &str) -> CryptoResult<SymmetricKey> {
    let decoded = STANDARD.decode(encoded)?;
    let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("expected {} key bytes, got {}", KEY_LEN, decoded.len()))
    })?;
    Ok(SymmetricKey(bytes))
}
