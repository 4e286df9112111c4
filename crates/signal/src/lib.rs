//! Signal definitions for the commit/abort protocol
//!
//! This crate defines:
//! - The positional word layout of every commit, complete and abort signal
//! - The packed-signal codec with its verification and diagnostics dump
//! - Per-direction signal sets so each role only sends what it may send
//! - The transport frame

pub mod abort;
pub mod commit;
pub mod envelope;
mod error;
mod frame;
mod gsn;
pub mod packed;
mod signal;

pub use abort::{
    Abort, AbortRouting, Aborted, PushAbortTrainOrd, SendPushAbortConf, SendPushAbortReq,
};
pub use commit::{
    Commit, CommitConf, CommitRef, CommitReq, Complete, CompleteConf, CompleteRef, CompleteReq,
    Completed, Committed, NodeConf, NodeRef, OperationAck,
};
pub use envelope::{
    CoordinatorSignal, Direction, ParticipantSignal, RouterRequest, RouterSignal,
    coordinator_packed_mask, participant_packed_mask,
};
pub use error::{PackedError, ProtocolViolation, Result, SignalError};
pub use frame::SignalFrame;
pub use gsn::Gsn;
pub use packed::{LqhKeyConf, MAX_PACKED_WORDS, PackedSignal, PackedTag};
pub use signal::SignalData;
