//! Storage boundary
//!
//! The protocol never touches rows itself. It asks the store to make an
//! operation's changes durable at a GCI, to roll them back, or to release
//! what commit left behind.

use kestrel_common::{Gci, TransactionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Identity of one operation as the store sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreOp {
    pub trans_id: TransactionId,
    pub tc_oprec: u32,
}

/// Store failure; the code travels in CommitRef/CompleteRef
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Store error {code}")]
pub struct StoreError {
    pub code: u32,
}

impl StoreError {
    /// Out of space for the committed row version
    pub const NO_SPACE: u32 = 630;
    /// Constraint checked at commit time failed
    pub const CONSTRAINT: u32 = 893;

    pub fn new(code: u32) -> Self {
        Self { code }
    }
}

/// Storage operations driven by the commit protocol
///
/// Calls are synchronous; a participant thread finishes a transition before
/// it takes the next signal.
pub trait TupleStore: Send {
    /// Make the operation's changes durable at `gci`
    fn commit(&mut self, op: StoreOp, gci: Gci) -> Result<(), StoreError>;

    /// Undo the operation; safe for operations the store never saw
    fn rollback(&mut self, op: StoreOp);

    /// Release what commit kept around (old versions, locks)
    fn complete(&mut self, _op: StoreOp) -> Result<(), StoreError> {
        Ok(())
    }

    /// Store name for logging
    fn store_name(&self) -> &str;
}

#[derive(Default)]
struct MemoryStoreInner {
    committed: HashMap<StoreOp, Gci>,
    commit_calls: HashMap<StoreOp, u32>,
    complete_calls: HashMap<StoreOp, u32>,
    rollback_calls: HashMap<StoreOp, u32>,
    failing: HashMap<TransactionId, u32>,
    failing_completes: HashMap<TransactionId, u32>,
}

/// In-memory store with apply counters and failure injection.
///
/// Clones share state, so a test can keep one clone to inspect what the
/// thread owning the other one did.
#[derive(Clone, Default)]
pub struct MemoryStore {
    name: String,
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::default(),
        }
    }

    /// Make every commit of `trans_id` fail with `code`
    pub fn fail_commits_of(&self, trans_id: TransactionId, code: u32) {
        self.inner.lock().failing.insert(trans_id, code);
    }

    /// Make every complete of `trans_id` fail with `code`
    pub fn fail_completes_of(&self, trans_id: TransactionId, code: u32) {
        self.inner.lock().failing_completes.insert(trans_id, code);
    }

    /// Let completes of `trans_id` succeed again
    pub fn heal_completes_of(&self, trans_id: TransactionId) {
        self.inner.lock().failing_completes.remove(&trans_id);
    }

    pub fn commit_count(&self, op: StoreOp) -> u32 {
        self.inner.lock().commit_calls.get(&op).copied().unwrap_or(0)
    }

    pub fn complete_count(&self, op: StoreOp) -> u32 {
        self.inner.lock().complete_calls.get(&op).copied().unwrap_or(0)
    }

    pub fn rollback_count(&self, op: StoreOp) -> u32 {
        self.inner.lock().rollback_calls.get(&op).copied().unwrap_or(0)
    }

    /// GCI the operation's changes are durable at, if committed
    pub fn committed_gci(&self, op: StoreOp) -> Option<Gci> {
        self.inner.lock().committed.get(&op).copied()
    }

    /// Number of operations currently committed and not rolled back
    pub fn committed_len(&self) -> usize {
        self.inner.lock().committed.len()
    }
}

impl TupleStore for MemoryStore {
    fn commit(&mut self, op: StoreOp, gci: Gci) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        *inner.commit_calls.entry(op).or_default() += 1;
        if let Some(&code) = inner.failing.get(&op.trans_id) {
            return Err(StoreError::new(code));
        }
        inner.committed.insert(op, gci);
        Ok(())
    }

    fn rollback(&mut self, op: StoreOp) {
        let mut inner = self.inner.lock();
        *inner.rollback_calls.entry(op).or_default() += 1;
        inner.committed.remove(&op);
    }

    fn complete(&mut self, op: StoreOp) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        *inner.complete_calls.entry(op).or_default() += 1;
        if let Some(&code) = inner.failing_completes.get(&op.trans_id) {
            return Err(StoreError::new(code));
        }
        Ok(())
    }

    fn store_name(&self) -> &str {
        &self.name
    }
}
