//! Message signatures: RSA-PSS over SHA-256
//!
//! Signatures are computed over the exact ciphertext string carried in an
//! envelope, so they are checked before anything is decrypted.

use super::asymmetric::{PrivateKey, PublicKey};
use super::errors::{CryptoError, CryptoResult};
use aes_gcm::aead::OsRng;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Hex-encoded SHA-256 digest
pub fn sha256(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn sign(message: &str, private_key: &PrivateKey) -> CryptoResult<String> {
    let signing_key = BlindedSigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign_with_rng(&mut OsRng, message.as_bytes())
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(STANDARD.encode(signature.to_bytes()))
}

pub fn verify(signature: &str, message: &str, public_key: &PublicKey) -> bool {
    let Ok(raw) = STANDARD.decode(signature) else {
        debug!("signature is not valid base64");
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        debug!("signature has an invalid encoding");
        return false;
    };

    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(message.as_bytes(), &signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::keypair;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sign_verify() {
        let (public_key, private_key) = keypair(0);

        let signature = sign("enc-message", &private_key).unwrap();
        assert!(verify(&signature, "enc-message", &public_key));
    }

    #[test]
    fn test_tampered_message_rejected() {
        let (public_key, private_key) = keypair(0);

        let signature = sign("enc-message", &private_key).unwrap();
        assert!(!verify(&signature, "enc-messagf", &public_key));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (_, private_key) = keypair(0);
        let (other_public, _) = keypair(1);

        let signature = sign("enc-message", &private_key).unwrap();
        assert!(!verify(&signature, "enc-message", &other_public));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let (public_key, _) = keypair(0);
        assert!(!verify("not base64", "m", &public_key));
        assert!(!verify("", "m", &public_key));
    }
}
