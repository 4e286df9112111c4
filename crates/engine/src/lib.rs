//! In-memory signal transport
//!
//! This crate provides the network the protocol roles talk over in tests and
//! simulations: endpoints addressed by block reference, ordered point-to-point
//! delivery, delivery holds, and node-failure injection.

use kestrel_common::{BlockRef, NodeId};
use thiserror::Error;

pub mod client;
pub mod engine;
pub mod message;

pub use client::{Endpoint, EndpointSender};
pub use engine::Network;
pub use message::Inbound;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("No endpoint registered at {0}")]
    UnknownEndpoint(BlockRef),

    #[error("Address {0} already in use")]
    AddressInUse(BlockRef),

    #[error("Node {0} has failed")]
    NodeFailed(NodeId),

    #[error("Endpoint {0} closed its inbox")]
    ChannelClosed(BlockRef),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_signal::{Gsn, SignalFrame};
    use std::sync::Arc;

    fn frame(sender: BlockRef, word: u32) -> SignalFrame {
        SignalFrame::new(Gsn::Committed, sender, vec![word, 1, 42])
    }

    #[tokio::test]
    async fn test_point_to_point_order() {
        let network = Arc::new(Network::new());
        let a = BlockRef::new(NodeId(1), 245);
        let b = BlockRef::new(NodeId(2), 1);
        let ep_a = network.register(a).unwrap();
        let mut ep_b = network.register(b).unwrap();

        for i in 0..3 {
            ep_a.send(b, frame(a, i)).unwrap();
        }
        for i in 0..3 {
            let inbound = ep_b.recv().await.unwrap();
            assert_eq!(inbound.signal().unwrap().data[0], i);
            assert_eq!(inbound.signal().unwrap().sender, a);
        }
        assert!(ep_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_addresses() {
        let network = Arc::new(Network::new());
        let a = BlockRef::new(NodeId(1), 245);
        let ep_a = network.register(a).unwrap();
        assert!(matches!(
            network.register(a),
            Err(NetworkError::AddressInUse(_))
        ));

        let nowhere = BlockRef::new(NodeId(9), 1);
        assert_eq!(
            ep_a.send(nowhere, frame(a, 0)),
            Err(NetworkError::UnknownEndpoint(nowhere))
        );
    }

    #[tokio::test]
    async fn test_node_failure_notifies_survivors() {
        let network = Arc::new(Network::new());
        let tc = BlockRef::new(NodeId(1), 245);
        let lqh = BlockRef::new(NodeId(2), 1);
        let mut ep_tc = network.register(tc).unwrap();
        let _ep_lqh = network.register(lqh).unwrap();

        network.fail_node(NodeId(2));

        assert_eq!(ep_tc.recv().await, Some(Inbound::NodeFailed(NodeId(2))));
        assert!(network.is_failed(NodeId(2)));
        assert!(!network.is_registered(lqh));
        assert_eq!(
            ep_tc.send(lqh, frame(tc, 0)),
            Err(NetworkError::NodeFailed(NodeId(2)))
        );
        assert!(network.register(lqh).is_err());

        // Reporting the same failure twice is a no-op
        network.fail_node(NodeId(2));
        assert!(ep_tc.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let network = Arc::new(Network::new());
        let a = BlockRef::new(NodeId(1), 245);
        let b = BlockRef::new(NodeId(2), 1);
        let ep_a = network.register(a).unwrap();
        let mut ep_b = network.register(b).unwrap();

        network.hold(b);
        ep_a.send(b, frame(a, 1)).unwrap();
        ep_a.send(b, frame(a, 2)).unwrap();
        assert_eq!(network.held_count(b), 2);
        assert!(ep_b.try_recv().is_none());

        assert_eq!(network.release(b).unwrap(), 2);
        assert_eq!(ep_b.recv().await.unwrap().signal().unwrap().data[0], 1);
        assert_eq!(ep_b.recv().await.unwrap().signal().unwrap().data[0], 2);
    }
}
