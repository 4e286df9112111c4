//! Transport frame: global signal number, sender and payload words

use crate::Gsn;
use kestrel_common::BlockRef;
use serde::{Deserialize, Serialize};

/// One signal as it travels between endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFrame {
    pub gsn: Gsn,
    pub sender: BlockRef,
    pub data: Vec<u32>,
}

impl SignalFrame {
    pub fn new(gsn: Gsn, sender: BlockRef, data: Vec<u32>) -> Self {
        Self { gsn, sender, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
