//! RSA key handling and OAEP (SHA-256) encryption
//!
//! Keys travel as base64 DER: SPKI for public keys, PKCS#8 for private keys.
//! Encryption helpers report failure as `None` and log it; callers decide
//! whether a missing result is fatal.

use super::errors::{CryptoError, CryptoResult};
use aes_gcm::aead::OsRng;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::error;

pub type PublicKey = RsaPublicKey;
pub type PrivateKey = RsaPrivateKey;

pub fn generate_asymmetric_keypair(bits: usize) -> CryptoResult<(PublicKey, PrivateKey)> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((public_key, private_key))
}

pub fn encrypt_asymmetric(plaintext: &str, public_key: &PublicKey) -> Option<String> {
    match public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes()) {
        Ok(ciphertext) => Some(STANDARD.encode(ciphertext)),
        Err(e) => {
            error!(error = %e, "RSA encryption failed");
            None
        }
    }
}

pub fn decrypt_asymmetric(ciphertext: &str, private_key: &PrivateKey) -> Option<String> {
    let decoded = match STANDARD.decode(ciphertext) {
        Ok(decoded) => decoded,
        Err(e) => {
            error!(error = %e, "RSA ciphertext is not valid base64");
            return None;
        }
    };

    match private_key.decrypt(Oaep::new::<Sha256>(), &decoded) {
        Ok(plaintext) => String::from_utf8(plaintext)
            .map_err(|e| error!(error = %e, "RSA plaintext is not UTF-8"))
            .ok(),
        Err(e) => {
            error!(error = %e, "RSA decryption failed");
            None
        }
    }
}

pub fn public_key_to_string(public_key: &PublicKey) -> CryptoResult<String> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

pub fn string_to_public_key(encoded: &str) -> CryptoResult<PublicKey> {
    let der = STANDARD.decode(encoded)?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

pub fn private_key_to_string(private_key: &PrivateKey) -> CryptoResult<String> {
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

pub fn string_to_private_key(encoded: &str) -> CryptoResult<PrivateKey> {
    let der = STANDARD.decode(encoded)?;
    RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}
