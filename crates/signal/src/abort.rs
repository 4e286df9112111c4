//! Abort family and push-abort fan-out

use crate::error::{Result, SignalError};
use crate::{Gsn, SignalData};
use kestrel_common::{BlockRef, NodeId, ThreadId, TransactionId};
use serde::{Deserialize, Serialize};

/// Optional trailing words of an Abort
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortRouting {
    /// Four-word form
    Plain,
    /// Five-word form naming the block instance owning the operation
    Keyed { instance_key: u32 },
    /// Seven-word form used when a participant thread forwards the abort
    Distributed {
        instance_key: u32,
        thread_id: ThreadId,
        sender_thread_signal_id: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub tc_oprec: u32,
    pub tc_blockref: BlockRef,
    pub trans_id: TransactionId,
    pub routing: AbortRouting,
}

impl Abort {
    pub const SIGNAL_LENGTH: usize = 4;
    pub const SIGNAL_LENGTH_KEY: usize = 5;
    pub const SIGNAL_LENGTH_DISTR: usize = 7;

    pub fn plain(tc_oprec: u32, tc_blockref: BlockRef, trans_id: TransactionId) -> Self {
        Self {
            tc_oprec,
            tc_blockref,
            trans_id,
            routing: AbortRouting::Plain,
        }
    }
}

impl SignalData for Abort {
    const GSN: Gsn = Gsn::Abort;
    const LENGTHS: &'static [usize] = &[
        Abort::SIGNAL_LENGTH,
        Abort::SIGNAL_LENGTH_KEY,
        Abort::SIGNAL_LENGTH_DISTR,
    ];

    fn to_words(&self) -> Vec<u32> {
        let mut words = vec![
            self.tc_oprec,
            self.tc_blockref.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
        ];
        match self.routing {
            AbortRouting::Plain => {}
            AbortRouting::Keyed { instance_key } => words.push(instance_key),
            AbortRouting::Distributed {
                instance_key,
                thread_id,
                sender_thread_signal_id,
            } => words.extend([instance_key, thread_id.0, sender_thread_signal_id]),
        }
        words
    }

    fn from_checked_words(data: &[u32]) -> Self {
        let routing = match data.len() {
            Abort::SIGNAL_LENGTH_KEY => AbortRouting::Keyed {
                instance_key: data[4],
            },
            Abort::SIGNAL_LENGTH_DISTR => AbortRouting::Distributed {
                instance_key: data[4],
                thread_id: ThreadId(data[5]),
                sender_thread_signal_id: data[6],
            },
            _ => AbortRouting::Plain,
        };
        Self {
            tc_oprec: data[0],
            tc_blockref: BlockRef::from_u32(data[1]),
            trans_id: TransactionId::new(data[2], data[3]),
            routing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aborted {
    /// Coordinator's operation token
    pub sender_data: u32,
    pub trans_id: TransactionId,
    pub node_id: NodeId,
    /// Set by the last replica of the chain; the whole chain is then aborted
    pub last_lqh: bool,
}

impl SignalData for Aborted {
    const GSN: Gsn = Gsn::Aborted;
    const LENGTHS: &'static [usize] = &[5];

    fn to_words(&self) -> Vec<u32> {
        vec![
            self.sender_data,
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.node_id.as_u32(),
            self.last_lqh as u32,
        ]
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            sender_data: data[0],
            trans_id: TransactionId::new(data[1], data[2]),
            node_id: NodeId(data[3] as u16),
            last_lqh: data[4] != 0,
        }
    }
}

/// Ask the routing agent to tell sibling threads to drop their references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPushAbortReq {
    pub tc_oprec: u32,
    pub tc_blockref: BlockRef,
    pub trans_id: TransactionId,
    /// Owning thread's address, where the confirmation goes
    pub sender_ref: BlockRef,
    pub send_thread_signal_id: u32,
    /// Owning thread
    pub thread_id: ThreadId,
    /// Threads holding references to the operation
    pub thread_ids: Vec<ThreadId>,
}

impl SendPushAbortReq {
    pub const STATIC_SIGNAL_LENGTH: usize = 8;
}

impl SignalData for SendPushAbortReq {
    const GSN: Gsn = Gsn::SendPushAbortReq;
    const LENGTHS: &'static [usize] = &[SendPushAbortReq::STATIC_SIGNAL_LENGTH];

    fn check_length(data: &[u32]) -> Result<()> {
        if data.len() < Self::STATIC_SIGNAL_LENGTH {
            return Err(SignalError::LengthMismatch {
                signal: Self::GSN.name(),
                actual: data.len(),
                expected: Self::LENGTHS.to_vec(),
            });
        }
        let declared = data[6] as usize;
        let actual = data.len() - Self::STATIC_SIGNAL_LENGTH;
        if declared != actual {
            return Err(SignalError::TrailingMismatch {
                signal: Self::GSN.name(),
                declared,
                actual,
            });
        }
        Ok(())
    }

    fn to_words(&self) -> Vec<u32> {
        let mut words = vec![
            self.tc_oprec,
            self.tc_blockref.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.sender_ref.as_u32(),
            self.send_thread_signal_id,
            self.thread_ids.len() as u32,
            self.thread_id.0,
        ];
        words.extend(self.thread_ids.iter().map(|t| t.0));
        words
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            tc_oprec: data[0],
            tc_blockref: BlockRef::from_u32(data[1]),
            trans_id: TransactionId::new(data[2], data[3]),
            sender_ref: BlockRef::from_u32(data[4]),
            send_thread_signal_id: data[5],
            thread_id: ThreadId(data[7]),
            thread_ids: data[Self::STATIC_SIGNAL_LENGTH..]
                .iter()
                .map(|&t| ThreadId(t))
                .collect(),
        }
    }
}

/// Routing agent accepted the fan-out for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPushAbortConf {
    pub tc_oprec: u32,
    pub tc_blockref: BlockRef,
    pub trans_id: TransactionId,
    pub thread_id: ThreadId,
    pub send_thread_signal_id: u32,
}

impl SignalData for SendPushAbortConf {
    const GSN: Gsn = Gsn::SendPushAbortConf;
    const LENGTHS: &'static [usize] = &[6];

    fn to_words(&self) -> Vec<u32> {
        vec![
            self.tc_oprec,
            self.tc_blockref.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.thread_id.0,
            self.send_thread_signal_id,
        ]
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            tc_oprec: data[0],
            tc_blockref: BlockRef::from_u32(data[1]),
            trans_id: TransactionId::new(data[2], data[3]),
            thread_id: ThreadId(data[4]),
            send_thread_signal_id: data[5],
        }
    }
}

/// Per-thread order to drop references to an aborted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAbortTrainOrd {
    pub tc_oprec: u32,
    pub tc_blockref: BlockRef,
    pub trans_id: TransactionId,
    /// Receiving thread
    pub thread_id: ThreadId,
    pub send_thread_signal_id: u32,
    pub index_query_thread: bool,
    /// Owning thread that requested the fan-out
    pub abort_ref: BlockRef,
}

impl SignalData for PushAbortTrainOrd {
    const GSN: Gsn = Gsn::PushAbortTrainOrd;
    const LENGTHS: &'static [usize] = &[8];

    fn to_words(&self) -> Vec<u32> {
        vec![
            self.tc_oprec,
            self.tc_blockref.as_u32(),
            self.trans_id.transid1,
            self.trans_id.transid2,
            self.thread_id.0,
            self.send_thread_signal_id,
            self.index_query_thread as u32,
            self.abort_ref.as_u32(),
        ]
    }

    fn from_checked_words(data: &[u32]) -> Self {
        Self {
            tc_oprec: data[0],
            tc_blockref: BlockRef::from_u32(data[1]),
            trans_id: TransactionId::new(data[2], data[3]),
            thread_id: ThreadId(data[4]),
            send_thread_signal_id: data[5],
            index_query_thread: data[6] != 0,
            abort_ref: BlockRef::from_u32(data[7]),
        }
    }
}
