//! Engine and transport implementations

pub mod memory_relay;
pub mod todo_list;

pub use memory_relay::{MemoryRelay, RelayTransport};
pub use todo_list::{CardOp, OpId, StampedOp, TodoDocument, TodoListEngine};
