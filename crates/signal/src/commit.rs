//! Commit and complete family
//!
//! Requests travel coordinator to participant; the acknowledgements travel
//! back. `tcConnectPtr` in an acknowledgement is always the coordinator's own
//! token for the operation, echoed so the coordinator can find its record
//! without a search.

use crate::{Gsn, SignalData};
use kestrel_common::{BlockRef, Gci, NodeId, TransactionId};
use serde::{Deserialize, Serialize};

/// Standalone commit request, also used by a takeover coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReq {
    /// Requester's token, echoed in the acknowledgement
    pub req_ptr: u32,
    /// Requester's address, where the acknowledgement goes
    pub req_blockref: BlockRef,
    pub gci: Gci,
    pub trans_id: TransactionId,
    /// Coordinator the operation was prepared under
    pub old_blockref: BlockRef,
    /// Operation token under `old_blockref`
    pub tc_oprec: u32,
}

impl CommitReq {
    /// Whether the request comes from a coordinator other than the one the
    /// operation was prepared under
    pub fn is_handoff(&self) -> bool {
        self.old_blockref != self.req_blockref
    }
}

impl SignalData for CommitReq {
    const GSN: Gsn = Gsn::CommitReq;
    const LENGTHS: &'static [usize] = &[8];

    fn to_words(&self) -> Vec<u32> {
        vec![
            self.req_ptr,
            self.req_blockref.as_u32(),
            self.gci.hi,
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.old_blockref.as_u32(),
            self.tc_oprec,
            self.gci.lo,
        ]
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            req_ptr: data[0],
            req_blockref: BlockRef::from_u32(data[1]),
            gci: Gci::new(data[2], data[7]),
            trans_id: TransactionId::new(data[3], data[4]),
            old_blockref: BlockRef::from_u32(data[5]),
            tc_oprec: data[6],
        }
    }
}

/// Short commit addressed by the participant's own record word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tc_connect_ptr: u32,
    pub gci: Gci,
    pub trans_id: TransactionId,
}

impl SignalData for Commit {
    const GSN: Gsn = Gsn::Commit;
    const LENGTHS: &'static [usize] = &[5];

    fn to_words(&self) -> Vec<u32> {
        vec![
            self.tc_connect_ptr,
            self.gci.hi,
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.gci.lo,
        ]
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            tc_connect_ptr: data[0],
            gci: Gci::new(data[1], data[4]),
            trans_id: TransactionId::new(data[2], data[3]),
        }
    }
}

/// Three-word acknowledgement shape shared by Committed, Complete and
/// Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAck {
    pub tc_connect_ptr: u32,
    pub trans_id: TransactionId,
}

impl OperationAck {
    fn words(&self) -> Vec<u32> {
        vec![
            self.tc_connect_ptr,
            self.trans_id.transid1,
            self.trans_id.transid2,
        ]
    }

    fn read(data: &[u32]) -> Self {
        Self {
            tc_connect_ptr: data[0],
            trans_id: TransactionId::new(data[1], data[2]),
        }
    }
}

/// Commit acknowledgement to the coordinator the operation was prepared under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed(pub OperationAck);

impl SignalData for Committed {
    const GSN: Gsn = Gsn::Committed;
    const LENGTHS: &'static [usize] = &[3];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(OperationAck::read(data))
    }
}

/// Short complete addressed by the participant's own record word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete(pub OperationAck);

impl SignalData for Complete {
    const GSN: Gsn = Gsn::Complete;
    const LENGTHS: &'static [usize] = &[3];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(OperationAck::read(data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completed(pub OperationAck);

impl SignalData for Completed {
    const GSN: Gsn = Gsn::Completed;
    const LENGTHS: &'static [usize] = &[3];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(OperationAck::read(data))
    }
}

/// Standalone complete request, also used by a takeover coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteReq {
    pub req_ptr: u32,
    pub req_blockref: BlockRef,
    pub trans_id: TransactionId,
    pub old_blockref: BlockRef,
    pub tc_oprec: u32,
}

impl CompleteReq {
    pub fn is_handoff(&self) -> bool {
        self.old_blockref != self.req_blockref
    }
}

impl SignalData for CompleteReq {
    const GSN: Gsn = Gsn::CompleteReq;
    const LENGTHS: &'static [usize] = &[6];

    fn to_words(&self) -> Vec<u32> {
        vec![
            self.req_ptr,
            self.req_blockref.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.old_blockref.as_u32(),
            self.tc_oprec,
        ]
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            req_ptr: data[0],
            req_blockref: BlockRef::from_u32(data[1]),
            trans_id: TransactionId::new(data[2], data[3]),
            old_blockref: BlockRef::from_u32(data[4]),
            tc_oprec: data[5],
        }
    }
}

/// Four-word confirmation shape shared by CommitConf and CompleteConf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConf {
    pub tc_connect_ptr: u32,
    pub sender_node_id: NodeId,
    pub trans_id: TransactionId,
}

impl NodeConf {
    fn words(&self) -> Vec<u32> {
        vec![
            self.tc_connect_ptr,
            self.sender_node_id.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
        ]
    }

    fn read(data: &[u32]) -> Self {
        Self {
            tc_connect_ptr: data[0],
            sender_node_id: NodeId(data[1] as u16),
            trans_id: TransactionId::new(data[2], data[3]),
        }
    }
}

/// Commit acknowledgement to a takeover coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitConf(pub NodeConf);

impl SignalData for CommitConf {
    const GSN: Gsn = Gsn::CommitConf;
    const LENGTHS: &'static [usize] = &[4];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(NodeConf::read(data))
    }
}

/// Complete acknowledgement to a takeover coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteConf(pub NodeConf);

impl SignalData for CompleteConf {
    const GSN: Gsn = Gsn::CompleteConf;
    const LENGTHS: &'static [usize] = &[4];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(NodeConf::read(data))
    }
}

/// Negative acknowledgement shape shared by CommitRef and CompleteRef
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub tc_connect_ptr: u32,
    pub sender_node_id: NodeId,
    pub trans_id: TransactionId,
    pub error_code: u32,
}

impl NodeRef {
    fn words(&self) -> Vec<u32> {
        vec![
            self.tc_connect_ptr,
            self.sender_node_id.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.error_code,
        ]
    }

    fn read(data: &[u32]) -> Self {
        Self {
            tc_connect_ptr: data[0],
            sender_node_id: NodeId(data[1] as u16),
            trans_id: TransactionId::new(data[2], data[3]),
            error_code: data[4],
        }
    }
}

/// The participant could not commit; the operation is rolled back locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef(pub NodeRef);

impl SignalData for CommitRef {
    const GSN: Gsn = Gsn::CommitRef;
    const LENGTHS: &'static [usize] = &[5];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(NodeRef::read(data))
    }
}

/// The participant could not complete; the row stays committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRef(pub NodeRef);

impl SignalData for CompleteRef {
    const GSN: Gsn = Gsn::CompleteRef;
    const LENGTHS: &'static [usize] = &[5];

    fn to_words(&self) -> Vec<u32> {
        self.0.words()
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self(NodeRef::read(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SignalError;
    use kestrel_common::NodeId;

    fn tc() -> BlockRef {
        BlockRef::new(NodeId(1), 245)
    }

    #[test]
    fn test_commit_req_layout() {
        let req = CommitReq {
            req_ptr: 7,
            req_blockref: tc(),
            gci: Gci::new(3, 0),
            trans_id: TransactionId::new(1, 42),
            old_blockref: tc(),
            tc_oprec: 7,
        };
        assert_eq!(
            req.to_words(),
            vec![7, tc().as_u32(), 3, 1, 42, tc().as_u32(), 7, 0]
        );
        assert!(!req.is_handoff());
        assert_eq!(CommitReq::from_words(&req.to_words()).unwrap(), req);
    }

    #[test]
    fn test_handoff_detection() {
        let req = CompleteReq {
            req_ptr: 1,
            req_blockref: BlockRef::new(NodeId(2), 245),
            trans_id: TransactionId::new(1, 42),
            old_blockref: tc(),
            tc_oprec: 7,
        };
        assert!(req.is_handoff());
    }

    #[test]
    fn test_commit_gci_lo_is_last_word() {
        let words = [9, 3, 1, 42, 5];
        let commit = Commit::from_words(&words).unwrap();
        assert_eq!(commit.gci, Gci::new(3, 5));
        assert_eq!(commit.trans_id, TransactionId::new(1, 42));
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let err = CommitReq::from_words(&[1, 2, 3, 4, 5, 6, 7]).unwrap_err();
        assert!(matches!(
            err,
            SignalError::LengthMismatch {
                signal: "COMMIT_REQ",
                actual: 7,
                ..
            }
        ));
        assert!(Committed::from_words(&[1, 2, 3, 4]).is_err());
        assert!(CommitRef::from_words(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_commit_ref_carries_error_code() {
        let r = CommitRef(NodeRef {
            tc_connect_ptr: 7,
            sender_node_id: NodeId(2),
            trans_id: TransactionId::new(1, 42),
            error_code: 630,
        });
        assert_eq!(r.to_words(), vec![7, 2, 1, 42, 630]);
    }
}
