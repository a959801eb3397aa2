//! Error types for core_sync

use crate::core_crypto::CryptoError;
use crate::core_envelope::CodecError;
use std::fmt;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;
pub type CrdtResult<T> = Result<T, CrdtError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Group already exists: {0}")]
    GroupExists(String),

    #[error("Unknown contact: {0}")]
    UnknownContact(String),

    /// Operation requires a different document state
    #[error("Group {group} is {state}")]
    LifecycleMismatch { group: String, state: String },

    #[error("No key for group {0}")]
    MissingGroupKey(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Envelope error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("CRDT engine error: {0}")]
    Crdt(#[from] CrdtError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::MalformedPayload(e.to_string())
    }
}

/// Failures reported by a [`CrdtEngine`](super::crdt::CrdtEngine)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Invalid change set: {0}")]
    InvalidChangeSet(String),

    #[error("Event {event} does not match mutation {mutation}")]
    EventMismatch { event: String, mutation: String },

    #[error("Card index {index} out of range ({len} cards)")]
    IndexOutOfRange { index: usize, len: usize },

    /// No Lamport counter is left for a new local op
    #[error("Op counter exhausted")]
    CounterExhausted,

    /// The engine itself failed; the same input may succeed later
    #[error("Engine failure: {0}")]
    Engine(String),
}

impl CrdtError {
    /// Whether replaying the same update later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrdtError::Engine(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    #[error("Rejected by relay: {0}")]
    Rejected(String),
}

/// Why an inbound message was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    AuthenticationFailed,
    Undecryptable,
    MalformedPayload,
    UnknownGroup,
    UnknownContact,
    NotAMember,
    MissingGroupKey,
    FromSelf,
    UnsolicitedResponse,
    GroupExists,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::AuthenticationFailed => "authentication_failed",
            DropReason::Undecryptable => "undecryptable",
            DropReason::MalformedPayload => "malformed_payload",
            DropReason::UnknownGroup => "unknown_group",
            DropReason::UnknownContact => "unknown_contact",
            DropReason::NotAMember => "not_a_member",
            DropReason::MissingGroupKey => "missing_group_key",
            DropReason::FromSelf => "from_self",
            DropReason::UnsolicitedResponse => "unsolicited_response",
            DropReason::GroupExists => "group_exists",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&CodecError> for DropReason {
    fn from(e: &CodecError) -> Self {
        match e {
            CodecError::AuthenticationFailed(_) => DropReason::AuthenticationFailed,
            CodecError::UnknownContact(_) => DropReason::UnknownContact,
            CodecError::KeyWrap(_) | CodecError::Crypto(_) => DropReason::Undecryptable,
        }
    }
}

/// Result of handling one inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Handled,
    Dropped(DropReason),
}

impl InboundOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, InboundOutcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::LifecycleMismatch {
            group: "Groceries".to_string(),
            state: "waiting_for_peer_merge".to_string(),
        };
        assert_eq!(err.to_string(), "Group Groceries is waiting_for_peer_merge");

        let err = CrdtError::IndexOutOfRange { index: 3, len: 1 };
        assert_eq!(err.to_string(), "Card index 3 out of range (1 cards)");
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        assert!(matches!(SyncError::from(json_err), SyncError::MalformedPayload(_)));

        let codec = CodecError::AuthenticationFailed("mallory@example.com".to_string());
        assert_eq!(DropReason::from(&codec), DropReason::AuthenticationFailed);
        assert!(matches!(SyncError::from(codec), SyncError::Codec(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(CrdtError::Engine("busy".to_string()).is_retryable());
        assert!(!CrdtError::InvalidChangeSet("[".to_string()).is_retryable());
    }
}
