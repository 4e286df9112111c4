//! Coordinator-side transaction records

use kestrel_common::{BlockRef, Gci, NodeId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a transaction is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Operations prepared, no decision yet
    Started,
    CollectingCommitAcks,
    CollectingCompleteAcks,
    CollectingAbortAcks,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Acknowledgement ledger entry of one replica in the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    /// No request sent in this phase
    NotSent,
    Outstanding,
    Acked,
    /// Covered by the last replica's Aborted
    Implied,
    /// Replica's node failed
    Excluded,
}

impl SlotStatus {
    /// Counts towards the fan-out gate
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            SlotStatus::Acked | SlotStatus::Implied | SlotStatus::Excluded
        )
    }
}

/// One replica of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub participant: BlockRef,
    /// Participant's record word, learned from LQHKEYCONF
    pub lqh_ptr: Option<u32>,
    pub status: SlotStatus,
    pub complete_refusals: u32,
}

impl Slot {
    fn new(participant: BlockRef) -> Self {
        Self {
            participant,
            lqh_ptr: None,
            status: SlotStatus::NotSent,
            complete_refusals: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != SlotStatus::Excluded
    }
}

/// One operation and its replicas, in abort-chain order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEntry {
    pub tc_oprec: u32,
    pub slots: Vec<Slot>,
}

impl OperationEntry {
    pub fn slot_mut(&mut self, participant: BlockRef) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.participant == participant)
    }

    pub fn has_live_replica(&self) -> bool {
        self.slots.iter().any(Slot::is_live)
    }

    pub fn is_settled(&self) -> bool {
        self.slots.iter().all(|s| s.status.is_settled())
    }
}

/// Operation as planned by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPlan {
    /// Token the participants echo back; unique among active operations
    pub tc_oprec: u32,
    /// Replicas in abort-chain order
    pub chain: Vec<BlockRef>,
}

/// Transaction as planned by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPlan {
    pub trans_id: TransactionId,
    pub operations: Vec<OperationPlan>,
}

impl TransactionPlan {
    pub fn new(trans_id: TransactionId) -> Self {
        Self {
            trans_id,
            operations: Vec::new(),
        }
    }

    pub fn operation(mut self, tc_oprec: u32, chain: Vec<BlockRef>) -> Self {
        self.operations.push(OperationPlan { tc_oprec, chain });
        self
    }
}

/// Why a transaction aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The caller asked for it
    Requested,
    /// A replica refused the commit
    CommitRefused { node: NodeId, error_code: u32 },
    /// Every replica of an operation was lost
    ReplicasLost { tc_oprec: u32 },
    /// Coordinator is aborting everything in flight
    AbortAll,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Requested => write!(f, "abort requested"),
            AbortReason::CommitRefused { node, error_code } => {
                write!(f, "node {} refused commit with error {}", node, error_code)
            }
            AbortReason::ReplicasLost { tc_oprec } => {
                write!(f, "all replicas of operation {} lost", tc_oprec)
            }
            AbortReason::AbortAll => write!(f, "aborted with all in-flight transactions"),
        }
    }
}

/// What the caller learns about a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutcome {
    Committed { gci: Gci },
    Aborted { reason: AbortReason },
    /// Reconciliation required
    Unknown { reason: String },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }
}

/// A transaction in flight
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub trans_id: TransactionId,
    pub operations: Vec<OperationEntry>,
    pub phase: Phase,
    pub gci: Option<Gci>,
    pub abort_reason: Option<AbortReason>,
}

impl TransactionRecord {
    pub fn new(plan: &TransactionPlan) -> Self {
        Self {
            trans_id: plan.trans_id,
            operations: plan
                .operations
                .iter()
                .map(|op| OperationEntry {
                    tc_oprec: op.tc_oprec,
                    slots: op.chain.iter().copied().map(Slot::new).collect(),
                })
                .collect(),
            phase: Phase::Started,
            gci: None,
            abort_reason: None,
        }
    }

    pub fn operation_mut(&mut self, tc_oprec: u32) -> Option<&mut OperationEntry> {
        self.operations.iter_mut().find(|op| op.tc_oprec == tc_oprec)
    }

    /// Every slot of the current fan-out set is settled
    pub fn is_settled(&self) -> bool {
        self.operations.iter().all(OperationEntry::is_settled)
    }

    /// Distinct participants, in first-seen order
    pub fn participants(&self) -> Vec<BlockRef> {
        let mut seen = Vec::new();
        for slot in self.operations.iter().flat_map(|op| &op.slots) {
            if !seen.contains(&slot.participant) {
                seen.push(slot.participant);
            }
        }
        seen
    }

    /// Operation left without any live replica
    pub fn lost_operation(&self) -> Option<u32> {
        self.operations
            .iter()
            .find(|op| !op.has_live_replica())
            .map(|op| op.tc_oprec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lqh(node: u16) -> BlockRef {
        BlockRef::new(NodeId(node), 0x1000)
    }

    #[test]
    fn test_record_from_plan() {
        let plan = TransactionPlan::new(TransactionId::new(1, 42))
            .operation(7, vec![lqh(2), lqh(3)])
            .operation(8, vec![lqh(3)]);
        let mut record = TransactionRecord::new(&plan);

        assert_eq!(record.phase, Phase::Started);
        assert_eq!(record.participants(), vec![lqh(2), lqh(3)]);
        assert!(!record.is_settled());
        assert_eq!(record.lost_operation(), None);

        for op in &mut record.operations {
            for slot in &mut op.slots {
                slot.status = SlotStatus::Excluded;
            }
        }
        assert!(record.is_settled());
        assert_eq!(record.lost_operation(), Some(7));
    }
}
