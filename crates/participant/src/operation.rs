//! Operation records held by a participant thread

use kestrel_common::{BlockRef, Gci, ThreadId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::StoreOp;

/// Lifecycle of one operation at one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    /// Prepared, waiting for the decision
    Idle,
    CommitPending,
    Committed,
    CompletePending,
    Completed,
    /// Waiting for the routing agent before rolling back
    Aborting,
    Aborted,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Aborted)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the participant sends once an abort finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReply {
    /// Coordinator asked for the abort
    Aborted { forward: bool },
    /// Commit failed in the store
    CommitRef {
        to: BlockRef,
        req_ptr: u32,
        error_code: u32,
    },
}

/// Prepare request handed to a participant thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub trans_id: TransactionId,
    /// Coordinator's token for the operation
    pub tc_oprec: u32,
    /// Coordinator the operation is prepared under
    pub tc_ref: BlockRef,
    /// Every replica of the operation, in abort-chain order
    pub chain: Vec<BlockRef>,
    /// Other threads of this node that reference the operation
    pub siblings: Vec<ThreadId>,
}

/// One operation at one replica
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub trans_id: TransactionId,
    pub tc_oprec: u32,
    /// Coordinator the operation was prepared under; part of the lookup key
    pub origin_ref: BlockRef,
    /// Coordinator that currently gets the acknowledgements
    pub tc_ref: BlockRef,
    pub state: OperationState,
    pub gci: Option<Gci>,
    /// Next replica of the abort chain
    pub next_replica: Option<BlockRef>,
    pub last_replica: bool,
    pub siblings: Vec<ThreadId>,
    /// Coordinator failed after commit; waiting for a takeover
    pub in_doubt: bool,
    pub pending_abort: Option<AbortReply>,
}

impl OperationRecord {
    pub fn prepared(request: &PrepareRequest, position: usize) -> Self {
        Self {
            trans_id: request.trans_id,
            tc_oprec: request.tc_oprec,
            origin_ref: request.tc_ref,
            tc_ref: request.tc_ref,
            state: OperationState::Idle,
            gci: None,
            next_replica: request.chain.get(position + 1).copied(),
            last_replica: position + 1 == request.chain.len(),
            siblings: request.siblings.clone(),
            in_doubt: false,
            pending_abort: None,
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            origin_ref: self.origin_ref,
            tc_oprec: self.tc_oprec,
        }
    }

    pub fn store_op(&self) -> StoreOp {
        StoreOp {
            trans_id: self.trans_id,
            tc_oprec: self.tc_oprec,
        }
    }
}

/// Lookup key of an operation: the coordinator it was prepared under and
/// that coordinator's token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub origin_ref: BlockRef,
    pub tc_oprec: u32,
}

/// How a finished operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedOutcome {
    Completed { gci: Gci },
    Aborted {
        last_replica: bool,
        commit_error: Option<u32>,
    },
}

/// Remembered after release to answer late duplicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedOperation {
    pub key: OperationKey,
    pub trans_id: TransactionId,
    pub lqh_word: u32,
    pub tc_ref: BlockRef,
    pub outcome: FinishedOutcome,
}

/// Commit-ack marker: the transaction committed here and the coordinator
/// has not yet confirmed it is finished with it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMarker {
    pub tc_ref: BlockRef,
    pub gci: Gci,
    pub operations: u32,
    pub in_doubt: bool,
}
