//! In-memory signal network
//!
//! Endpoints are keyed by block reference. Delivery between two endpoints is
//! in send order; nothing is ordered across different senders. Failing a node
//! removes its endpoints and notifies every surviving endpoint, which is the
//! failure-detector report the protocol reacts to.

use crate::{Endpoint, Inbound, NetworkError, Result};
use kestrel_common::{BlockRef, NodeId};
use kestrel_signal::SignalFrame;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Network shared by every node of a test cluster
pub struct Network {
    /// Inbox senders by address
    endpoints: Mutex<HashMap<BlockRef, mpsc::UnboundedSender<Inbound>>>,

    /// Nodes reported failed; their addresses cannot be registered again
    failed: Mutex<HashSet<NodeId>>,

    /// Addresses whose deliveries are parked until released
    held: Mutex<HashMap<BlockRef, Vec<SignalFrame>>>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Register an endpoint at `address`
    pub fn register(self: &Arc<Self>, address: BlockRef) -> Result<Endpoint> {
        if self.failed.lock().contains(&address.node()) {
            return Err(NetworkError::NodeFailed(address.node()));
        }

        let mut endpoints = self.endpoints.lock();
        if endpoints.get(&address).is_some_and(|tx| !tx.is_closed()) {
            return Err(NetworkError::AddressInUse(address));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(address, tx);
        tracing::debug!("[network] Registered endpoint {}", address);

        Ok(Endpoint::new(address, self.clone(), rx))
    }

    /// Remove an endpoint; pending deliveries are dropped
    pub fn deregister(&self, address: BlockRef) {
        self.endpoints.lock().remove(&address);
        self.held.lock().remove(&address);
    }

    /// Deliver a frame to `to`
    pub fn send(&self, to: BlockRef, frame: SignalFrame) -> Result<()> {
        if self.failed.lock().contains(&to.node()) {
            return Err(NetworkError::NodeFailed(to.node()));
        }

        if let Some(parked) = self.held.lock().get_mut(&to) {
            parked.push(frame);
            return Ok(());
        }

        let endpoints = self.endpoints.lock();
        let tx = endpoints
            .get(&to)
            .ok_or(NetworkError::UnknownEndpoint(to))?;
        tx.send(Inbound::Signal(frame))
            .map_err(|_| NetworkError::ChannelClosed(to))
    }

    /// Park deliveries to `address` until [`Network::release`]
    pub fn hold(&self, address: BlockRef) {
        self.held.lock().entry(address).or_default();
    }

    /// Deliver everything parked for `address`, in order, and stop parking
    pub fn release(&self, address: BlockRef) -> Result<usize> {
        let parked = self.held.lock().remove(&address).unwrap_or_default();
        let count = parked.len();
        for frame in parked {
            self.send(address, frame)?;
        }
        Ok(count)
    }

    /// Number of frames parked for `address`
    pub fn held_count(&self, address: BlockRef) -> usize {
        self.held.lock().get(&address).map_or(0, Vec::len)
    }

    /// Fail a node: drop its endpoints and report the failure to every
    /// surviving endpoint
    pub fn fail_node(&self, node: NodeId) {
        if !self.failed.lock().insert(node) {
            return;
        }

        let survivors: Vec<mpsc::UnboundedSender<Inbound>> = {
            let mut endpoints = self.endpoints.lock();
            endpoints.retain(|address, _| address.node() != node);
            endpoints.values().cloned().collect()
        };
        self.held.lock().retain(|address, _| address.node() != node);

        tracing::warn!(
            "[network] Node {} failed, notifying {} endpoints",
            node,
            survivors.len()
        );
        for tx in survivors {
            let _ = tx.send(Inbound::NodeFailed(node));
        }
    }

    pub fn is_failed(&self, node: NodeId) -> bool {
        self.failed.lock().contains(&node)
    }

    /// Whether anything is listening at `address`
    pub fn is_registered(&self, address: BlockRef) -> bool {
        self.endpoints
            .lock()
            .get(&address)
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}
