//! Node, block and thread addressing
//!
//! A block reference names one protocol endpoint: a node in the cluster plus
//! a block instance on that node. It travels as a single 32-bit word with the
//! node id in the low half and the block instance in the high half.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    pub const fn new(id: u16) -> Self {
        NodeId(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receive-thread number inside a multi-threaded participant node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thr{}", self.0)
    }
}

/// Address of one protocol endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRef(u32);

impl BlockRef {
    /// Build a reference from a node and a block instance number
    pub const fn new(node: NodeId, block: u16) -> Self {
        BlockRef(((block as u32) << 16) | node.0 as u32)
    }

    /// Reinterpret a wire word
    pub const fn from_u32(word: u32) -> Self {
        BlockRef(word)
    }

    /// The wire word
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn node(&self) -> NodeId {
        NodeId(self.0 as u16)
    }

    pub const fn block(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node(), self.block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ref_packing() {
        let r = BlockRef::new(NodeId(3), 0x0102);
        assert_eq!(r.node(), NodeId(3));
        assert_eq!(r.block(), 0x0102);
        assert_eq!(r.as_u32(), 0x0102_0003);
        assert_eq!(BlockRef::from_u32(r.as_u32()), r);
        assert_eq!(r.to_string(), "3/258");
    }
}
