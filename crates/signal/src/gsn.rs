//! Global signal numbers
//!
//! Outside a packed frame a signal is identified by the transport's global
//! signal number, never by its contents.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Gsn {
    Abort = 21,
    Aborted = 22,
    Commit = 61,
    Committed = 62,
    CommitReq = 63,
    CommitConf = 64,
    CommitRef = 65,
    Complete = 66,
    Completed = 67,
    CompleteReq = 68,
    CompleteConf = 69,
    CompleteRef = 70,
    Packed = 150,
    SendPushAbortReq = 740,
    SendPushAbortConf = 741,
    PushAbortTrainOrd = 742,
}

impl Gsn {
    pub const ALL: [Gsn; 16] = [
        Gsn::Abort,
        Gsn::Aborted,
        Gsn::Commit,
        Gsn::Committed,
        Gsn::CommitReq,
        Gsn::CommitConf,
        Gsn::CommitRef,
        Gsn::Complete,
        Gsn::Completed,
        Gsn::CompleteReq,
        Gsn::CompleteConf,
        Gsn::CompleteRef,
        Gsn::Packed,
        Gsn::SendPushAbortReq,
        Gsn::SendPushAbortConf,
        Gsn::PushAbortTrainOrd,
    ];

    pub fn number(self) -> u16 {
        self as u16
    }

    pub fn from_number(number: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|gsn| gsn.number() == number)
    }

    pub fn name(self) -> &'static str {
        match self {
            Gsn::Abort => "ABORT",
            Gsn::Aborted => "ABORTED",
            Gsn::Commit => "COMMIT",
            Gsn::Committed => "COMMITTED",
            Gsn::CommitReq => "COMMIT_REQ",
            Gsn::CommitConf => "COMMIT_CONF",
            Gsn::CommitRef => "COMMIT_REF",
            Gsn::Complete => "COMPLETE",
            Gsn::Completed => "COMPLETED",
            Gsn::CompleteReq => "COMPLETE_REQ",
            Gsn::CompleteConf => "COMPLETE_CONF",
            Gsn::CompleteRef => "COMPLETE_REF",
            Gsn::Packed => "PACKED_SIGNAL",
            Gsn::SendPushAbortReq => "SEND_PUSH_ABORT_REQ",
            Gsn::SendPushAbortConf => "SEND_PUSH_ABORT_CONF",
            Gsn::PushAbortTrainOrd => "PUSH_ABORT_TRAIN_ORD",
        }
    }
}

impl fmt::Display for Gsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_are_unique_and_resolvable() {
        for gsn in Gsn::ALL {
            assert_eq!(Gsn::from_number(gsn.number()), Some(gsn));
        }
        assert_eq!(Gsn::from_number(1), None);
    }
}
