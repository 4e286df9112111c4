//! Common types for the Kestrel commit protocol
//!
//! This crate defines:
//! - Transaction identities carried as two 32-bit words
//! - Node, block and thread addressing
//! - Global checkpoint identifiers and the GCI clock
//! - The generation-checked record pool used by both protocol roles

mod arena;
mod block_ref;
mod gci;
mod transaction_id;

pub use arena::{Arena, ArenaError, Handle, MAX_ARENA_CAPACITY};
pub use block_ref::{BlockRef, NodeId, ThreadId};
pub use gci::{Gci, GciClock, SharedGciClock};
pub use transaction_id::TransactionId;
