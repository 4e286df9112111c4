//! Error types for the participant

use kestrel_common::{BlockRef, ThreadId, TransactionId};
use kestrel_engine::NetworkError;
use kestrel_signal::ProtocolViolation;
use thiserror::Error;

/// Participant error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParticipantError {
    #[error("Operation pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("Operation {tc_oprec} of transaction {trans_id} already prepared")]
    DuplicateOperation {
        trans_id: TransactionId,
        tc_oprec: u32,
    },

    #[error("{0} is not in the operation's replica chain")]
    NotInChain(BlockRef),

    #[error("Unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("Thread {0} is a query thread and cannot own operations")]
    NotAnOwnerThread(ThreadId),

    #[error("Thread {0} listed more than once as a sibling")]
    DuplicateSibling(ThreadId),

    #[error("Owner thread {0} listed as its own sibling")]
    OwnerAsSibling(ThreadId),

    #[error("Protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Participant halted: {0}")]
    Halted(String),
}

/// Result type for participant operations
pub type Result<T> = std::result::Result<T, ParticipantError>;
