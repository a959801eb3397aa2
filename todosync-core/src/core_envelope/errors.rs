//! Error types for envelope wrapping and unwrapping

use crate::core_crypto::CryptoError;
use thiserror::Error;

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No public key on record for the peer
    #[error("Unknown contact: {0}")]
    UnknownContact(String),

    /// Signature did not verify against the expected sender key
    #[error("Signature verification failed for message from {0}")]
    AuthenticationFailed(String),

    /// RSA wrapping or unwrapping of the message key failed
    #[error("Message key could not be {0}")]
    KeyWrap(&'static str),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
