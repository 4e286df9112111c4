//! Error types for signal decoding

use crate::Gsn;
use kestrel_common::{BlockRef, TransactionId};
use thiserror::Error;

/// Rejection of a standalone signal or envelope
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("{signal}: length {actual} not in accepted lengths {expected:?}")]
    LengthMismatch {
        signal: &'static str,
        actual: usize,
        expected: Vec<usize>,
    },

    #[error("{signal}: declared {declared} trailing words, frame carries {actual}")]
    TrailingMismatch {
        signal: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("Unknown global signal number {0}")]
    UnknownGsn(u16),

    #[error("{gsn} is not a {direction} signal")]
    WrongDirection { gsn: Gsn, direction: &'static str },

    #[error("Packed frame rejected: {0}")]
    Packed(#[from] PackedError),
}

/// Rejection of a packed frame
///
/// Any of these rejects the frame whole; no sub-message of a rejected frame
/// is processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackedError {
    #[error("Frame of {len} words exceeds the {max} word bound")]
    FrameTooLong { len: usize, max: usize },

    #[error("Unknown tag {tag} at word {pos}")]
    UnknownTag { tag: u32, pos: usize },

    #[error("Tag {tag} at word {pos} not allowed here (mask 0x{allowed:02x})")]
    UnexpectedTag { tag: u32, pos: usize, allowed: u32 },

    #[error("Sub-message at word {pos} needs {needed} words, {remaining} remain")]
    Truncated {
        pos: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Consumed {consumed} words, frame declares {declared}")]
    LengthMismatch { consumed: usize, declared: usize },

    #[error("Commit sub-message length {0} is not supported")]
    InvalidCommitLength(u32),

    #[error("Token 0x{0:08x} does not fit in 28 bits")]
    TokenTooWide(u32),
}

/// Fatal protocol breach detected by either role.
///
/// The receiving task halts on any of these; nothing about the offending
/// signal is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("Malformed signal from {sender}: {source}")]
    Malformed {
        sender: BlockRef,
        #[source]
        source: SignalError,
    },

    #[error("Unknown operation token 0x{token:08x} for transaction {trans_id}")]
    UnknownOperation { token: u32, trans_id: TransactionId },

    #[error("Token 0x{token:08x} belongs to transaction {expected}, signal carries {actual}")]
    TransactionMismatch {
        token: u32,
        expected: TransactionId,
        actual: TransactionId,
    },

    #[error("{signal} not valid for operation of {trans_id} in state {state}")]
    InvalidTransition {
        signal: &'static str,
        trans_id: TransactionId,
        state: String,
    },

    #[error("Acknowledgement for unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    #[error("{sender} is not a participant of transaction {trans_id} (token 0x{token:08x})")]
    NotAMember {
        trans_id: TransactionId,
        token: u32,
        sender: BlockRef,
    },

    #[error("{signal} from {sender} for transaction {trans_id} answers no outstanding request")]
    NoOutstandingRequest {
        signal: &'static str,
        trans_id: TransactionId,
        sender: BlockRef,
    },
}

pub type Result<T> = std::result::Result<T, SignalError>;
