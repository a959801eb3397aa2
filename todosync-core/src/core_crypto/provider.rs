//! Device identity keypair

use super::asymmetric::{
    decrypt_asymmetric, generate_asymmetric_keypair, private_key_to_string,
    public_key_to_string, string_to_private_key, PrivateKey, PublicKey,
};
use super::errors::CryptoResult;
use super::signing;
use tracing::info;

/// Owns this device's RSA keypair for the lifetime of the process
pub struct CryptoProvider {
    public_key: PublicKey,
    private_key: PrivateKey,
}

impl CryptoProvider {
    /// Generate a fresh identity keypair
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        let (public_key, private_key) = generate_asymmetric_keypair(bits)?;
        info!(bits, "Generated device identity keypair");
        Ok(Self { public_key, private_key })
    }

    /// Restore an identity from a PKCS#8 private key string
    pub fn from_private_key_string(encoded: &str) -> CryptoResult<Self> {
        let private_key = string_to_private_key(encoded)?;
        Ok(Self::from_private_key(private_key))
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self { public_key, private_key }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn public_key_string(&self) -> CryptoResult<String> {
        public_key_to_string(&self.public_key)
    }

    pub fn private_key_string(&self) -> CryptoResult<String> {
        private_key_to_string(&self.private_key)
    }

    pub fn sign(&self, message: &str) -> CryptoResult<String> {
        signing::sign(message, &self.private_key)
    }

    /// Unwrap a key or message that was RSA-encrypted for this device
    pub fn decrypt_with_own_key(&self, ciphertext: &str) -> Option<String> {
        decrypt_asymmetric(ciphertext, &self.private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::{encrypt_asymmetric, verify};
    use crate::test_utils::fixtures::provider;

    #[test]
    fn test_provider_signs_and_decrypts() {
        let provider = provider(0);

        let signature = provider.sign("payload").unwrap();
        assert!(verify(&signature, "payload", provider.public_key()));

        let ciphertext = encrypt_asymmetric("wrapped", provider.public_key()).unwrap();
        assert_eq!(provider.decrypt_with_own_key(&ciphertext).unwrap(), "wrapped");
    }

    #[test]
    fn test_restore_from_private_key_string() {
        let original = provider(1);
        let encoded = original.private_key_string().unwrap();

        let restored = CryptoProvider::from_private_key_string(&encoded).unwrap();
        assert_eq!(restored.public_key(), original.public_key());
        assert_eq!(restored.public_key_string().unwrap(), original.public_key_string().unwrap());
    }
}
