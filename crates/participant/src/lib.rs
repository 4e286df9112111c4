//! Participant side of the commit/abort protocol
//!
//! This crate provides:
//! - The per-thread kernel that commits, completes and aborts operations
//! - The push-abort routing agent for operations referenced across threads
//! - The storage boundary the kernel drives
//! - A node runtime running the kernels and the agent over the network

mod config;
mod error;
pub mod kernel;
mod node;
pub mod operation;
pub mod router;
pub mod store;

pub use config::ParticipantConfig;
pub use error::{ParticipantError, Result};
pub use kernel::{HeldReference, Outbound, ParticipantKernel};
pub use node::ParticipantNode;
pub use operation::{CommitMarker, OperationKey, OperationRecord, OperationState, PrepareRequest};
pub use router::PushAbortRouter;
pub use store::{MemoryStore, StoreError, StoreOp, TupleStore};

use kestrel_common::{BlockRef, NodeId, ThreadId};

/// Block number of the routing agent on every participant node
pub const ROUTER_BLOCK: u16 = 0x0F00;

/// Block number of participant thread 0; thread `n` is at base + n
pub const LQH_BLOCK_BASE: u16 = 0x1000;

/// Address of a participant thread
pub fn thread_ref(node: NodeId, thread: ThreadId) -> BlockRef {
    BlockRef::new(node, LQH_BLOCK_BASE + thread.0 as u16)
}

/// Address of a node's routing agent
pub fn router_ref(node: NodeId) -> BlockRef {
    BlockRef::new(node, ROUTER_BLOCK)
}
