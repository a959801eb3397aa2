/*
    core_sync - group lifecycle, update buffering and CRDT sequencing

    Sits between the push transport and the CRDT engine:
    - turns server and peer messages into group lifecycle transitions
    - buffers updates that arrive before their group is ready
    - applies local and remote changes under a per-group lock
    - broadcasts local changes to the group
*/

pub mod adapters;
pub mod crdt;
pub mod engine;
pub mod errors;
pub mod transport;

#[cfg(test)]
mod tests;

pub use crdt::{Card, CardMutation, ChangeSet, CrdtEngine, LocalChange};
pub use engine::{Identity, ServerEndpoint, SyncEngine, SyncServices};
pub use errors::{
    CrdtError, CrdtResult, DropReason, InboundOutcome, SyncError, SyncResult, TransportError,
};
pub use transport::Transport;
