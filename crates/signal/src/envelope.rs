//! Per-direction signal sets
//!
//! Each direction of the protocol gets its own closed enum, so a signal can
//! only be built and sent the way it is meant to travel. Decoding a frame into
//! a direction fails when its signal number belongs to another direction.

use crate::abort::{Abort, Aborted, PushAbortTrainOrd, SendPushAbortConf, SendPushAbortReq};
use crate::commit::{
    Commit, CommitConf, CommitRef, CommitReq, Complete, CompleteConf, CompleteRef, CompleteReq,
    Completed, Committed,
};
use crate::error::{Result, SignalError};
use crate::packed::{self, COMMIT_LENGTH, PackedSignal, PackedTag};
use crate::{Gsn, SignalData, SignalFrame};
use kestrel_common::BlockRef;

/// Which way a signal travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Coordinator (or forwarding replica) to participant thread
    ToParticipant,
    /// Participant thread to coordinator
    ToCoordinator,
    /// Participant thread to the routing agent
    ToRouter,
    /// Routing agent to participant thread
    FromRouter,
    /// Packed frames travel both ways; the sub-message tags decide
    Either,
}

impl Gsn {
    pub fn direction(self) -> Direction {
        match self {
            Gsn::CommitReq | Gsn::Commit | Gsn::CompleteReq | Gsn::Complete | Gsn::Abort => {
                Direction::ToParticipant
            }
            Gsn::Committed
            | Gsn::CommitConf
            | Gsn::CommitRef
            | Gsn::Completed
            | Gsn::CompleteConf
            | Gsn::CompleteRef
            | Gsn::Aborted => Direction::ToCoordinator,
            Gsn::SendPushAbortReq => Direction::ToRouter,
            Gsn::SendPushAbortConf | Gsn::PushAbortTrainOrd => Direction::FromRouter,
            Gsn::Packed => Direction::Either,
        }
    }
}

/// Sub-message tags a participant accepts in a packed frame
pub fn participant_packed_mask() -> u32 {
    PackedTag::mask(&[
        PackedTag::Commit,
        PackedTag::Complete,
        PackedTag::RemoveMarker,
    ])
}

/// Sub-message tags a coordinator accepts in a packed frame
pub fn coordinator_packed_mask() -> u32 {
    PackedTag::mask(&[
        PackedTag::Committed,
        PackedTag::Completed,
        PackedTag::LqhKeyConf,
    ])
}

fn packed_frame(sender: BlockRef, signals: &[PackedSignal]) -> Result<SignalFrame> {
    Ok(SignalFrame::new(
        Gsn::Packed,
        sender,
        packed::encode(signals)?,
    ))
}

fn wrong_direction(gsn: Gsn, direction: &'static str) -> SignalError {
    SignalError::WrongDirection { gsn, direction }
}

/// Signals a participant thread receives from a coordinator or a forwarding
/// replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorSignal {
    CommitReq(CommitReq),
    Commit(Commit),
    CompleteReq(CompleteReq),
    Complete(Complete),
    Abort(Abort),
    Packed(Vec<PackedSignal>),
}

impl CoordinatorSignal {
    pub fn decode(frame: &SignalFrame) -> Result<Self> {
        let data = &frame.data;
        Ok(match frame.gsn {
            Gsn::CommitReq => Self::CommitReq(CommitReq::from_words(data)?),
            Gsn::Commit => Self::Commit(Commit::from_words(data)?),
            Gsn::CompleteReq => Self::CompleteReq(CompleteReq::from_words(data)?),
            Gsn::Complete => Self::Complete(Complete::from_words(data)?),
            Gsn::Abort => Self::Abort(Abort::from_words(data)?),
            Gsn::Packed => Self::Packed(packed::decode_verified(
                data,
                participant_packed_mask(),
                COMMIT_LENGTH,
            )?),
            other => return Err(wrong_direction(other, "coordinator-to-participant")),
        })
    }

    pub fn to_frame(&self, sender: BlockRef) -> Result<SignalFrame> {
        Ok(match self {
            Self::CommitReq(s) => s.to_frame(sender),
            Self::Commit(s) => s.to_frame(sender),
            Self::CompleteReq(s) => s.to_frame(sender),
            Self::Complete(s) => s.to_frame(sender),
            Self::Abort(s) => s.to_frame(sender),
            Self::Packed(signals) => packed_frame(sender, signals)?,
        })
    }

    pub fn gsn(&self) -> Gsn {
        match self {
            Self::CommitReq(_) => Gsn::CommitReq,
            Self::Commit(_) => Gsn::Commit,
            Self::CompleteReq(_) => Gsn::CompleteReq,
            Self::Complete(_) => Gsn::Complete,
            Self::Abort(_) => Gsn::Abort,
            Self::Packed(_) => Gsn::Packed,
        }
    }
}

/// Acknowledgements a coordinator receives from participant threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantSignal {
    Committed(Committed),
    CommitConf(CommitConf),
    CommitRef(CommitRef),
    Completed(Completed),
    CompleteConf(CompleteConf),
    CompleteRef(CompleteRef),
    Aborted(Aborted),
    Packed(Vec<PackedSignal>),
}

impl ParticipantSignal {
    pub fn decode(frame: &SignalFrame) -> Result<Self> {
        let data = &frame.data;
        Ok(match frame.gsn {
            Gsn::Committed => Self::Committed(Committed::from_words(data)?),
            Gsn::CommitConf => Self::CommitConf(CommitConf::from_words(data)?),
            Gsn::CommitRef => Self::CommitRef(CommitRef::from_words(data)?),
            Gsn::Completed => Self::Completed(Completed::from_words(data)?),
            Gsn::CompleteConf => Self::CompleteConf(CompleteConf::from_words(data)?),
            Gsn::CompleteRef => Self::CompleteRef(CompleteRef::from_words(data)?),
            Gsn::Aborted => Self::Aborted(Aborted::from_words(data)?),
            Gsn::Packed => Self::Packed(packed::decode_verified(
                data,
                coordinator_packed_mask(),
                COMMIT_LENGTH,
            )?),
            other => return Err(wrong_direction(other, "participant-to-coordinator")),
        })
    }

    pub fn to_frame(&self, sender: BlockRef) -> Result<SignalFrame> {
        Ok(match self {
            Self::Committed(s) => s.to_frame(sender),
            Self::CommitConf(s) => s.to_frame(sender),
            Self::CommitRef(s) => s.to_frame(sender),
            Self::Completed(s) => s.to_frame(sender),
            Self::CompleteConf(s) => s.to_frame(sender),
            Self::CompleteRef(s) => s.to_frame(sender),
            Self::Aborted(s) => s.to_frame(sender),
            Self::Packed(signals) => packed_frame(sender, signals)?,
        })
    }
}

/// Requests a participant thread sends to its node's routing agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterRequest {
    SendPushAbortReq(SendPushAbortReq),
}

impl RouterRequest {
    pub fn decode(frame: &SignalFrame) -> Result<Self> {
        match frame.gsn {
            Gsn::SendPushAbortReq => Ok(Self::SendPushAbortReq(SendPushAbortReq::from_words(
                &frame.data,
            )?)),
            other => Err(wrong_direction(other, "participant-to-router")),
        }
    }

    pub fn to_frame(&self, sender: BlockRef) -> SignalFrame {
        match self {
            Self::SendPushAbortReq(s) => s.to_frame(sender),
        }
    }
}

/// Signals the routing agent sends to participant threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterSignal {
    SendPushAbortConf(SendPushAbortConf),
    PushAbortTrainOrd(PushAbortTrainOrd),
}

impl RouterSignal {
    pub fn decode(frame: &SignalFrame) -> Result<Self> {
        let data = &frame.data;
        Ok(match frame.gsn {
            Gsn::SendPushAbortConf => {
                Self::SendPushAbortConf(SendPushAbortConf::from_words(data)?)
            }
            Gsn::PushAbortTrainOrd => {
                Self::PushAbortTrainOrd(PushAbortTrainOrd::from_words(data)?)
            }
            other => return Err(wrong_direction(other, "router-to-participant")),
        })
    }

    pub fn to_frame(&self, sender: BlockRef) -> SignalFrame {
        match self {
            Self::SendPushAbortConf(s) => s.to_frame(sender),
            Self::PushAbortTrainOrd(s) => s.to_frame(sender),
        }
    }
}
