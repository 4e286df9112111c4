//! What an endpoint receives from the network

use kestrel_common::NodeId;
use kestrel_signal::SignalFrame;

/// Delivery to an endpoint inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A signal from another endpoint
    Signal(SignalFrame),
    /// Failure-detector report: every endpoint on the node is gone
    NodeFailed(NodeId),
}

impl Inbound {
    pub fn signal(&self) -> Option<&SignalFrame> {
        match self {
            Inbound::Signal(frame) => Some(frame),
            Inbound::NodeFailed(_) => None,
        }
    }
}

impl From<SignalFrame> for Inbound {
    fn from(frame: SignalFrame) -> Self {
        Inbound::Signal(frame)
    }
}
