//! Pre-generated identities

use crate::core_crypto::{generate_asymmetric_keypair, CryptoProvider, PrivateKey, PublicKey};
use std::sync::OnceLock;

const POOL_SIZE: usize = 6;
const TEST_KEY_BITS: usize = 1024;

/// Index reserved for the server / relay identity
pub const SERVER_KEY_INDEX: usize = 5;

fn pool() -> &'static [PrivateKey] {
    static KEYS: OnceLock<Vec<PrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| {
        (0..POOL_SIZE)
            .map(|_| generate_asymmetric_keypair(TEST_KEY_BITS).expect("test key generation").1)
            .collect()
    })
}

/// Keypair number `index` from the pool; the same index always yields the same key
pub fn keypair(index: usize) -> (PublicKey, PrivateKey) {
    let private_key = pool()[index].clone();
    (PublicKey::from(&private_key), private_key)
}

pub fn provider(index: usize) -> CryptoProvider {
    CryptoProvider::from_private_key(keypair(index).1)
}
