//! Error types for the coordinator

use crate::transaction::Phase;
use kestrel_common::{NodeId, TransactionId};
use kestrel_engine::NetworkError;
use kestrel_signal::ProtocolViolation;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Transaction pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("Replica on node {0} is unavailable")]
    ReplicaUnavailable(NodeId),

    #[error("Transaction {0} already started")]
    DuplicateTransaction(TransactionId),

    #[error("Operation {tc_oprec} already in use (transaction {trans_id})")]
    DuplicateOperation {
        trans_id: TransactionId,
        tc_oprec: u32,
    },

    #[error("Operation {tc_oprec} of transaction {trans_id} has no replicas")]
    EmptyReplicaChain {
        trans_id: TransactionId,
        tc_oprec: u32,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Cannot {action} transaction {trans_id} in phase {phase}")]
    InvalidState {
        trans_id: TransactionId,
        phase: Phase,
        action: &'static str,
    },

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<CoordinatorError>,
    },

    #[error("Coordinator halted: {0}")]
    Halted(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),
}

impl CoordinatorError {
    /// Temporary errors worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::PoolExhausted { .. } | CoordinatorError::ReplicaUnavailable(_)
        )
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
