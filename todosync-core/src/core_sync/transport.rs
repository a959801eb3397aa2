//! Transport trait - outbound half of the push channel
//!
//! Delivery is at-most-once and unordered. Inbound envelopes are handed to
//! [`SyncEngine::handle_inbound`](super::engine::SyncEngine::handle_inbound)
//! by whoever owns the receiving side.

use super::errors::TransportError;
use crate::core_envelope::Envelope;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand an envelope to the push provider for `destination`
    ///
    /// `Ok` only means the provider accepted it.
    async fn send(&self, envelope: Envelope, destination: &str) -> Result<(), TransportError>;
}
