//! Local group state
//!
//! ```text
//!   inbound update ──► UpdateBuffers ──drain──► GroupStore (per-group lock)
//!                                                  │
//!   local edit ────────────────────────────────────┘
//! ```

pub mod buffers;
pub mod store;
pub mod types;

pub use buffers::{BufferKind, PendingUpdate, UpdateBuffer, UpdateBuffers};
pub use store::{GroupLockGuard, GroupStore};
pub use types::{DocumentState, NewGroup, Snapshot};
