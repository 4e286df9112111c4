//! Endpoint handles
//!
//! An endpoint owns its inbox. The sending half is cheap to clone so a
//! node task and its API handle can both send from the same address.

use crate::{Inbound, Network, Result};
use kestrel_common::BlockRef;
use kestrel_signal::SignalFrame;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half bound to one source address
#[derive(Clone)]
pub struct EndpointSender {
    address: BlockRef,
    network: Arc<Network>,
}

impl EndpointSender {
    pub fn address(&self) -> BlockRef {
        self.address
    }

    /// Send a frame; the frame's sender field must be this address
    pub fn send(&self, to: BlockRef, frame: SignalFrame) -> Result<()> {
        debug_assert_eq!(frame.sender, self.address);
        self.network.send(to, frame)
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }
}

/// Registered endpoint: sending half plus inbox
pub struct Endpoint {
    sender: EndpointSender,
    inbox: mpsc::UnboundedReceiver<Inbound>,
}

impl Endpoint {
    pub(crate) fn new(
        address: BlockRef,
        network: Arc<Network>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            sender: EndpointSender { address, network },
            inbox,
        }
    }

    pub fn address(&self) -> BlockRef {
        self.sender.address
    }

    pub fn sender(&self) -> EndpointSender {
        self.sender.clone()
    }

    pub fn send(&self, to: BlockRef, frame: SignalFrame) -> Result<()> {
        self.sender.send(to, frame)
    }

    /// Receive the next delivery
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbox.recv().await
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.inbox.try_recv().ok()
    }

    /// Split into the sending half and the raw inbox
    pub fn split(self) -> (EndpointSender, mpsc::UnboundedReceiver<Inbound>) {
        (self.sender, self.inbox)
    }
}
