//! Coordinator kernel - transaction phases without I/O
//!
//! The kernel keeps one record per transaction with an acknowledgement
//! ledger per replica slot. A phase only advances once every slot of the
//! fan-out set is settled: acknowledged, implied by the last replica of an
//! abort chain, or excluded because its node failed.

use crate::error::{CoordinatorError, Result};
use crate::transaction::{
    AbortReason, OperationEntry, Phase, SlotStatus, TransactionOutcome, TransactionPlan,
    TransactionRecord,
};
use kestrel_common::{Arena, BlockRef, Gci, Handle, NodeId, SharedGciClock, TransactionId};
use kestrel_engine::Inbound;
use kestrel_signal::packed::{self, TOKEN_MASK};
use kestrel_signal::{
    Abort, Aborted, CommitReq, CompleteReq, CoordinatorSignal, LqhKeyConf, NodeRef, PackedSignal,
    ParticipantSignal, ProtocolViolation, SignalError, SignalFrame,
};
use std::collections::{HashMap, HashSet, VecDeque};

type KernelResult<T> = std::result::Result<T, ProtocolViolation>;

/// CompleteRef answers tolerated per replica before it is given up on
const MAX_COMPLETE_ATTEMPTS: u32 = 3;

/// A signal the kernel wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcOutbound {
    pub to: BlockRef,
    pub signal: CoordinatorSignal,
}

impl TcOutbound {
    pub fn to_frame(&self, sender: BlockRef) -> std::result::Result<SignalFrame, SignalError> {
        self.signal.to_frame(sender)
    }
}

/// Result of one kernel step
#[derive(Debug, Default)]
pub struct TcOutput {
    pub out: Vec<TcOutbound>,
    /// Transactions that reached a final outcome
    pub finished: Vec<(TransactionId, TransactionOutcome)>,
}

#[derive(Default)]
struct Effects {
    out: Vec<TcOutbound>,
    packed: Vec<(BlockRef, Vec<PackedSignal>)>,
    finished: Vec<(TransactionId, TransactionOutcome)>,
}

impl Effects {
    fn send(&mut self, to: BlockRef, signal: CoordinatorSignal) {
        self.out.push(TcOutbound { to, signal });
    }

    fn pack(&mut self, to: BlockRef, signal: PackedSignal) {
        match self.packed.iter_mut().find(|(dest, _)| *dest == to) {
            Some((_, signals)) => signals.push(signal),
            None => self.packed.push((to, vec![signal])),
        }
    }

    fn finish(mut self) -> TcOutput {
        for (to, signals) in self.packed {
            for batch in packed::batch(signals) {
                self.out.push(TcOutbound {
                    to,
                    signal: CoordinatorSignal::Packed(batch),
                });
            }
        }
        TcOutput {
            out: self.out,
            finished: self.finished,
        }
    }
}

/// Builds the requests of each phase
#[derive(Debug, Clone, Copy)]
struct Emitter {
    address: BlockRef,
    use_packed: bool,
}

impl Emitter {
    fn packed_word(&self, lqh_ptr: Option<u32>) -> Option<u32> {
        lqh_ptr.filter(|word| self.use_packed && *word <= TOKEN_MASK)
    }

    fn commit(
        &self,
        fx: &mut Effects,
        to: BlockRef,
        lqh_ptr: Option<u32>,
        tc_oprec: u32,
        gci: Gci,
        trans_id: TransactionId,
    ) {
        match self.packed_word(lqh_ptr) {
            Some(lqh_ptr) => fx.pack(
                to,
                PackedSignal::Commit {
                    lqh_ptr,
                    gci,
                    trans_id,
                },
            ),
            None => fx.send(
                to,
                CoordinatorSignal::CommitReq(CommitReq {
                    req_ptr: tc_oprec,
                    req_blockref: self.address,
                    gci,
                    trans_id,
                    old_blockref: self.address,
                    tc_oprec,
                }),
            ),
        }
    }

    fn complete(
        &self,
        fx: &mut Effects,
        to: BlockRef,
        lqh_ptr: Option<u32>,
        tc_oprec: u32,
        trans_id: TransactionId,
    ) {
        match self.packed_word(lqh_ptr) {
            Some(lqh_ptr) => fx.pack(to, PackedSignal::Complete { lqh_ptr, trans_id }),
            None => self.complete_req(fx, to, tc_oprec, trans_id),
        }
    }

    fn complete_req(&self, fx: &mut Effects, to: BlockRef, tc_oprec: u32, trans_id: TransactionId) {
        fx.send(
            to,
            CoordinatorSignal::CompleteReq(CompleteReq {
                req_ptr: tc_oprec,
                req_blockref: self.address,
                trans_id,
                old_blockref: self.address,
                tc_oprec,
            }),
        );
    }

    fn abort(&self, fx: &mut Effects, to: BlockRef, tc_oprec: u32, trans_id: TransactionId) {
        fx.send(
            to,
            CoordinatorSignal::Abort(Abort::plain(tc_oprec, self.address, trans_id)),
        );
    }

    /// Always packed: there is no unpacked REMOVE_MARKER
    fn remove_marker(&self, fx: &mut Effects, to: BlockRef, trans_id: TransactionId) {
        fx.pack(
            to,
            PackedSignal::RemoveMarker {
                fail_api: false,
                trans_id,
            },
        );
    }
}

/// Commit/abort kernel of one coordinator instance
pub struct TcKernel {
    emit: Emitter,

    clock: SharedGciClock,

    transactions: Arena<TransactionRecord>,

    by_transid: HashMap<TransactionId, Handle>,

    /// Operation tokens in use
    oprecs: HashMap<u32, TransactionId>,

    /// Recently finished transactions, oldest first
    finished: VecDeque<TransactionId>,

    finished_limit: usize,

    failed_nodes: HashSet<NodeId>,

    /// Log prefix
    name: String,
}

impl TcKernel {
    pub fn new(
        address: BlockRef,
        clock: SharedGciClock,
        pool_capacity: usize,
        use_packed: bool,
        finished_limit: usize,
    ) -> Self {
        let name = format!("tc {}", address);
        tracing::info!(
            "[{}] Kernel initialized with {} transaction records",
            name,
            pool_capacity
        );
        Self {
            emit: Emitter {
                address,
                use_packed,
            },
            clock,
            transactions: Arena::with_capacity(pool_capacity),
            by_transid: HashMap::new(),
            oprecs: HashMap::new(),
            finished: VecDeque::new(),
            finished_limit,
            failed_nodes: HashSet::new(),
            name,
        }
    }

    pub fn address(&self) -> BlockRef {
        self.emit.address
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction(&self, trans_id: TransactionId) -> Option<&TransactionRecord> {
        let handle = self.by_transid.get(&trans_id)?;
        self.transactions.get(*handle).ok()
    }

    pub fn phase(&self, trans_id: TransactionId) -> Option<Phase> {
        self.transaction(trans_id).map(|t| t.phase)
    }

    pub fn is_finished(&self, trans_id: TransactionId) -> bool {
        self.finished.contains(&trans_id)
    }

    // === CALLER OPERATIONS ===

    /// Seize a record for a planned transaction
    pub fn begin(&mut self, plan: &TransactionPlan) -> Result<()> {
        let trans_id = plan.trans_id;
        if self.by_transid.contains_key(&trans_id) {
            return Err(CoordinatorError::DuplicateTransaction(trans_id));
        }

        let mut tokens = HashSet::new();
        for op in &plan.operations {
            if op.chain.is_empty() {
                return Err(CoordinatorError::EmptyReplicaChain {
                    trans_id,
                    tc_oprec: op.tc_oprec,
                });
            }
            if self.oprecs.contains_key(&op.tc_oprec) || !tokens.insert(op.tc_oprec) {
                return Err(CoordinatorError::DuplicateOperation {
                    trans_id,
                    tc_oprec: op.tc_oprec,
                });
            }
            if let Some(failed) = op
                .chain
                .iter()
                .map(|replica| replica.node())
                .find(|node| self.failed_nodes.contains(node))
            {
                return Err(CoordinatorError::ReplicaUnavailable(failed));
            }
        }

        let handle = self
            .transactions
            .seize(TransactionRecord::new(plan))
            .map_err(|_| CoordinatorError::PoolExhausted {
                capacity: self.transactions.capacity(),
            })?;
        self.by_transid.insert(trans_id, handle);
        for op in &plan.operations {
            self.oprecs.insert(op.tc_oprec, trans_id);
        }
        self.finished.retain(|id| *id != trans_id);

        tracing::debug!(
            "[{}] Started {} with {} operations",
            self.name,
            trans_id,
            plan.operations.len()
        );
        Ok(())
    }

    /// Decide to commit: stamp the GCI and ask every live replica
    pub fn commit(&mut self, trans_id: TransactionId) -> Result<TcOutput> {
        let handle = self.handle(trans_id)?;
        let emit = self.emit;
        let gci = self.clock.current();
        let mut fx = Effects::default();

        let record = self.record_mut(handle)?;
        if record.phase != Phase::Started {
            return Err(CoordinatorError::InvalidState {
                trans_id,
                phase: record.phase,
                action: "commit",
            });
        }
        if let Some(tc_oprec) = record.lost_operation() {
            self.start_abort(handle, AbortReason::ReplicasLost { tc_oprec }, None, &mut fx);
            return Ok(fx.finish());
        }

        record.phase = Phase::CollectingCommitAcks;
        record.gci = Some(gci);
        for op in &mut record.operations {
            for slot in op.slots.iter_mut().filter(|s| s.is_live()) {
                slot.status = SlotStatus::Outstanding;
                emit.commit(
                    &mut fx,
                    slot.participant,
                    slot.lqh_ptr,
                    op.tc_oprec,
                    gci,
                    trans_id,
                );
            }
        }
        tracing::debug!("[{}] Committing {} at GCI {}", self.name, trans_id, gci);

        self.advance(handle, &mut fx);
        Ok(fx.finish())
    }

    /// Decide to abort. Too late once the commit decision has been acknowledged.
    pub fn abort(&mut self, trans_id: TransactionId, reason: AbortReason) -> Result<TcOutput> {
        let handle = self.handle(trans_id)?;
        let mut fx = Effects::default();
        let phase = self.record_mut(handle)?.phase;
        match phase {
            Phase::Started | Phase::CollectingCommitAcks => {
                self.start_abort(handle, reason, None, &mut fx)
            }
            Phase::CollectingAbortAcks => {}
            Phase::CollectingCompleteAcks | Phase::Done => {
                return Err(CoordinatorError::InvalidState {
                    trans_id,
                    phase,
                    action: "abort",
                });
            }
        }
        Ok(fx.finish())
    }

    /// Abort every transaction that has not reached its commit point.
    ///
    /// Returns how many were aborted.
    pub fn abort_all(&mut self) -> (usize, TcOutput) {
        let mut fx = Effects::default();
        let mut count = 0;
        for handle in self.transactions.handles() {
            let undecided = self.transactions.get(handle).is_ok_and(|record| {
                matches!(record.phase, Phase::Started | Phase::CollectingCommitAcks)
            });
            if undecided {
                self.start_abort(handle, AbortReason::AbortAll, None, &mut fx);
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!("[{}] Aborting all {} undecided transactions", self.name, count);
        }
        (count, fx.finish())
    }

    // === SIGNAL DISPATCH ===

    pub fn on_inbound(&mut self, inbound: &Inbound) -> KernelResult<TcOutput> {
        match inbound {
            Inbound::Signal(frame) => self.on_frame(frame),
            Inbound::NodeFailed(node) => Ok(self.on_node_failure(*node)),
        }
    }

    pub fn on_frame(&mut self, frame: &SignalFrame) -> KernelResult<TcOutput> {
        let signal =
            ParticipantSignal::decode(frame).map_err(|source| ProtocolViolation::Malformed {
                sender: frame.sender,
                source,
            })?;
        self.on_signal(frame.sender, signal)
    }

    /// Apply a decoded acknowledgement from `sender`
    pub fn on_signal(
        &mut self,
        sender: BlockRef,
        signal: ParticipantSignal,
    ) -> KernelResult<TcOutput> {
        let mut fx = Effects::default();
        match signal {
            ParticipantSignal::Committed(ack) => self.on_commit_ack(
                sender,
                ack.0.tc_connect_ptr,
                ack.0.trans_id,
                "COMMITTED",
                &mut fx,
            )?,
            ParticipantSignal::CommitConf(conf) => self.on_commit_ack(
                sender,
                conf.0.tc_connect_ptr,
                conf.0.trans_id,
                "COMMIT_CONF",
                &mut fx,
            )?,
            ParticipantSignal::CommitRef(refusal) => self.on_commit_ref(sender, refusal.0, &mut fx)?,
            ParticipantSignal::Completed(ack) => self.on_complete_ack(
                sender,
                ack.0.tc_connect_ptr,
                ack.0.trans_id,
                "COMPLETED",
                &mut fx,
            )?,
            ParticipantSignal::CompleteConf(conf) => self.on_complete_ack(
                sender,
                conf.0.tc_connect_ptr,
                conf.0.trans_id,
                "COMPLETE_CONF",
                &mut fx,
            )?,
            ParticipantSignal::CompleteRef(refusal) => {
                self.on_complete_ref(sender, refusal.0, &mut fx)?
            }
            ParticipantSignal::Aborted(aborted) => self.on_aborted(sender, aborted, &mut fx)?,
            ParticipantSignal::Packed(signals) => {
                for signal in signals {
                    match signal {
                        PackedSignal::Committed { tc_oprec, trans_id } => {
                            self.on_commit_ack(sender, tc_oprec, trans_id, "COMMITTED", &mut fx)?
                        }
                        PackedSignal::Completed { tc_oprec, trans_id } => {
                            self.on_complete_ack(sender, tc_oprec, trans_id, "COMPLETED", &mut fx)?
                        }
                        PackedSignal::LqhKeyConf(conf) => self.on_lqhkeyconf(sender, conf)?,
                        other => {
                            return Err(ProtocolViolation::InvalidTransition {
                                signal: other.tag().name(),
                                trans_id: other.trans_id(),
                                state: "packed to coordinator".to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(fx.finish())
    }

    // === ACKNOWLEDGEMENTS ===

    fn on_lqhkeyconf(&mut self, sender: BlockRef, conf: LqhKeyConf) -> KernelResult<()> {
        let Some(handle) = self.locate(conf.trans_id, "LQHKEYCONF")? else {
            return Ok(());
        };
        let record = self.record_checked(handle, conf.trans_id)?;
        let op = operation(record, conf.tc_oprec, conf.trans_id)?;
        let slot = op
            .slot_mut(sender)
            .ok_or(ProtocolViolation::NotAMember {
                trans_id: conf.trans_id,
                token: conf.tc_oprec,
                sender,
            })?;
        slot.lqh_ptr = Some(conf.lqh_ptr);
        Ok(())
    }

    fn on_commit_ack(
        &mut self,
        sender: BlockRef,
        tc_oprec: u32,
        trans_id: TransactionId,
        signal: &'static str,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let Some(handle) = self.locate(trans_id, signal)? else {
            return Ok(());
        };
        let name = self.name.clone();
        let record = self.record_checked(handle, trans_id)?;
        let phase = record.phase;
        let slot = slot_mut(record, tc_oprec, sender, trans_id)?;

        match (phase, slot.status) {
            (Phase::CollectingCommitAcks, SlotStatus::Outstanding) => {
                slot.status = SlotStatus::Acked;
            }
            (Phase::CollectingCommitAcks, SlotStatus::Acked)
            | (Phase::CollectingCompleteAcks, _)
            | (Phase::CollectingAbortAcks, _) => {
                tracing::debug!(
                    "[{}] Absorbed {} for operation {} of {} from {} in phase {}",
                    name,
                    signal,
                    tc_oprec,
                    trans_id,
                    sender,
                    phase
                );
                return Ok(());
            }
            (_, SlotStatus::Excluded) => return Ok(()),
            _ => {
                return Err(ProtocolViolation::NoOutstandingRequest {
                    signal,
                    trans_id,
                    sender,
                });
            }
        }
        self.advance(handle, fx);
        Ok(())
    }

    fn on_commit_ref(
        &mut self,
        sender: BlockRef,
        refusal: NodeRef,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let trans_id = refusal.trans_id;
        let tc_oprec = refusal.tc_connect_ptr;
        let Some(handle) = self.locate(trans_id, "COMMIT_REF")? else {
            return Ok(());
        };
        let emit = self.emit;
        let record = self.record_checked(handle, trans_id)?;
        let phase = record.phase;
        let status = slot_mut(record, tc_oprec, sender, trans_id)?.status;

        tracing::warn!(
            "[{}] {} refused commit of operation {} of {} with error {}",
            self.name,
            sender,
            tc_oprec,
            trans_id,
            refusal.error_code
        );

        match (phase, status) {
            (Phase::CollectingCommitAcks, SlotStatus::Outstanding) => {
                let reason = AbortReason::CommitRefused {
                    node: refusal.sender_node_id,
                    error_code: refusal.error_code,
                };
                self.start_abort(handle, reason, Some((tc_oprec, sender)), fx);
            }
            (Phase::CollectingAbortAcks, _) => {
                // The refusing replica already rolled back and will not
                // forward; reach the rest of its chain directly
                let record = self.record_checked(handle, trans_id)?;
                let op = operation(record, tc_oprec, trans_id)?;
                for slot in &mut op.slots {
                    if slot.participant == sender {
                        if slot.status == SlotStatus::Outstanding {
                            slot.status = SlotStatus::Acked;
                        }
                    } else if slot.status == SlotStatus::Outstanding {
                        emit.abort(fx, slot.participant, tc_oprec, trans_id);
                    }
                }
                self.advance(handle, fx);
            }
            (_, SlotStatus::Excluded) => {}
            _ => {
                return Err(ProtocolViolation::NoOutstandingRequest {
                    signal: "COMMIT_REF",
                    trans_id,
                    sender,
                });
            }
        }
        Ok(())
    }

    fn on_complete_ack(
        &mut self,
        sender: BlockRef,
        tc_oprec: u32,
        trans_id: TransactionId,
        signal: &'static str,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let Some(handle) = self.locate(trans_id, signal)? else {
            return Ok(());
        };
        let record = self.record_checked(handle, trans_id)?;
        let phase = record.phase;
        let slot = slot_mut(record, tc_oprec, sender, trans_id)?;

        match (phase, slot.status) {
            (Phase::CollectingCompleteAcks, SlotStatus::Outstanding) => {
                slot.status = SlotStatus::Acked;
            }
            (Phase::CollectingCompleteAcks, SlotStatus::Acked) => {
                tracing::debug!(
                    "[{}] Duplicate {} for operation {} of {}",
                    self.name,
                    signal,
                    tc_oprec,
                    trans_id
                );
                return Ok(());
            }
            (_, SlotStatus::Excluded) => return Ok(()),
            _ => {
                return Err(ProtocolViolation::NoOutstandingRequest {
                    signal,
                    trans_id,
                    sender,
                });
            }
        }
        self.advance(handle, fx);
        Ok(())
    }

    fn on_complete_ref(
        &mut self,
        sender: BlockRef,
        refusal: NodeRef,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let trans_id = refusal.trans_id;
        let tc_oprec = refusal.tc_connect_ptr;
        let Some(handle) = self.locate(trans_id, "COMPLETE_REF")? else {
            return Ok(());
        };
        let emit = self.emit;
        let name = self.name.clone();
        let record = self.record_checked(handle, trans_id)?;
        let phase = record.phase;
        let slot = slot_mut(record, tc_oprec, sender, trans_id)?;

        if phase != Phase::CollectingCompleteAcks || slot.status != SlotStatus::Outstanding {
            return Err(ProtocolViolation::NoOutstandingRequest {
                signal: "COMPLETE_REF",
                trans_id,
                sender,
            });
        }

        slot.complete_refusals += 1;
        if slot.complete_refusals < MAX_COMPLETE_ATTEMPTS {
            tracing::warn!(
                "[{}] {} failed to complete operation {} of {} (error {}), retrying",
                name,
                sender,
                tc_oprec,
                trans_id,
                refusal.error_code
            );
            emit.complete_req(fx, sender, tc_oprec, trans_id);
            return Ok(());
        }

        tracing::error!(
            "[{}] {} failed to complete operation {} of {} {} times, giving up on it",
            name,
            sender,
            tc_oprec,
            trans_id,
            slot.complete_refusals
        );
        slot.status = SlotStatus::Excluded;
        self.advance(handle, fx);
        Ok(())
    }

    fn on_aborted(
        &mut self,
        sender: BlockRef,
        aborted: Aborted,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let trans_id = aborted.trans_id;
        let tc_oprec = aborted.sender_data;
        let Some(handle) = self.locate(trans_id, "ABORTED")? else {
            return Ok(());
        };
        let record = self.record_checked(handle, trans_id)?;
        if record.phase != Phase::CollectingAbortAcks {
            return Err(ProtocolViolation::NoOutstandingRequest {
                signal: "ABORTED",
                trans_id,
                sender,
            });
        }

        let op = operation(record, tc_oprec, trans_id)?;
        let slot = op.slot_mut(sender).ok_or(ProtocolViolation::NotAMember {
            trans_id,
            token: tc_oprec,
            sender,
        })?;
        match slot.status {
            SlotStatus::Outstanding => slot.status = SlotStatus::Acked,
            SlotStatus::Acked | SlotStatus::Implied | SlotStatus::Excluded => {}
            SlotStatus::NotSent => {
                return Err(ProtocolViolation::NoOutstandingRequest {
                    signal: "ABORTED",
                    trans_id,
                    sender,
                });
            }
        }
        if aborted.last_lqh {
            for slot in &mut op.slots {
                if slot.status == SlotStatus::Outstanding {
                    slot.status = SlotStatus::Implied;
                }
            }
        }
        self.advance(handle, fx);
        Ok(())
    }

    // === PHASE TRANSITIONS ===

    /// Switch to the abort path. `refused` names a replica that already
    /// rolled back on its own.
    fn start_abort(
        &mut self,
        handle: Handle,
        reason: AbortReason,
        refused: Option<(u32, BlockRef)>,
        fx: &mut Effects,
    ) {
        let emit = self.emit;
        let Ok(record) = self.transactions.get_mut(handle) else {
            return;
        };
        let trans_id = record.trans_id;
        record.phase = Phase::CollectingAbortAcks;
        record.abort_reason.get_or_insert(reason);

        for op in &mut record.operations {
            let refused_here = refused
                .filter(|(tc_oprec, _)| *tc_oprec == op.tc_oprec)
                .map(|(_, participant)| participant);
            for slot in op.slots.iter_mut().filter(|s| s.is_live()) {
                slot.status = if Some(slot.participant) == refused_here {
                    SlotStatus::Acked
                } else {
                    SlotStatus::Outstanding
                };
            }

            let chain_intact = refused_here.is_none()
                && op.slots.iter().all(|s| s.is_live() && s.lqh_ptr.is_some());
            if chain_intact {
                emit.abort(fx, op.slots[0].participant, op.tc_oprec, trans_id);
            } else {
                abort_directly(emit, fx, op, trans_id);
            }
        }

        tracing::info!("[{}] Aborting {}: {}", self.name, trans_id, reason);
        self.advance(handle, fx);
    }

    /// Move through every phase whose fan-out set is settled
    fn advance(&mut self, handle: Handle, fx: &mut Effects) {
        let emit = self.emit;
        loop {
            let Ok(record) = self.transactions.get_mut(handle) else {
                return;
            };
            if !record.is_settled() {
                return;
            }

            match record.phase {
                Phase::CollectingCommitAcks => {
                    if let Some(tc_oprec) = record.lost_operation() {
                        self.start_abort(handle, AbortReason::ReplicasLost { tc_oprec }, None, fx);
                        return;
                    }
                    let trans_id = record.trans_id;
                    record.phase = Phase::CollectingCompleteAcks;
                    for op in &mut record.operations {
                        for slot in &mut op.slots {
                            if slot.status == SlotStatus::Acked {
                                slot.status = SlotStatus::Outstanding;
                                emit.complete(fx, slot.participant, slot.lqh_ptr, op.tc_oprec, trans_id);
                            }
                        }
                    }
                    tracing::debug!("[{}] {} committed everywhere, completing", self.name, trans_id);
                }
                Phase::CollectingCompleteAcks => {
                    let gci = record.gci.unwrap_or(Gci::ZERO);
                    let trans_id = record.trans_id;
                    let mut marked = Vec::new();
                    for slot in record.operations.iter().flat_map(|op| &op.slots) {
                        if slot.status == SlotStatus::Acked && !marked.contains(&slot.participant) {
                            marked.push(slot.participant);
                        }
                    }
                    for participant in marked {
                        emit.remove_marker(fx, participant, trans_id);
                    }
                    self.finish(handle, TransactionOutcome::Committed { gci }, fx);
                    return;
                }
                Phase::CollectingAbortAcks => {
                    let reason = record.abort_reason.unwrap_or(AbortReason::Requested);
                    self.finish(handle, TransactionOutcome::Aborted { reason }, fx);
                    return;
                }
                Phase::Started | Phase::Done => return,
            }
        }
    }

    fn finish(&mut self, handle: Handle, outcome: TransactionOutcome, fx: &mut Effects) {
        let Ok(mut record) = self.transactions.release(handle) else {
            return;
        };
        record.phase = Phase::Done;
        let trans_id = record.trans_id;
        self.by_transid.remove(&trans_id);
        for op in &record.operations {
            self.oprecs.remove(&op.tc_oprec);
        }
        self.finished.push_back(trans_id);
        while self.finished.len() > self.finished_limit {
            self.finished.pop_front();
        }

        tracing::info!("[{}] {} finished: {:?}", self.name, trans_id, outcome);
        fx.finished.push((trans_id, outcome));
    }

    // === NODE FAILURE ===

    /// Exclude the failed node's slots and repair what its loss broke
    pub fn on_node_failure(&mut self, node: NodeId) -> TcOutput {
        let emit = self.emit;
        let mut fx = Effects::default();
        self.failed_nodes.insert(node);

        for handle in self.transactions.handles() {
            let Ok(record) = self.transactions.get_mut(handle) else {
                continue;
            };
            let trans_id = record.trans_id;
            let phase = record.phase;
            let mut affected = Vec::new();
            for (index, op) in record.operations.iter_mut().enumerate() {
                let mut hit = false;
                for slot in &mut op.slots {
                    if slot.participant.node() == node && slot.status != SlotStatus::Excluded {
                        slot.status = SlotStatus::Excluded;
                        hit = true;
                    }
                }
                if hit {
                    affected.push(index);
                }
            }
            if affected.is_empty() {
                continue;
            }

            tracing::warn!(
                "[{}] Node {} failed with {} operations of {} in phase {}",
                self.name,
                node,
                affected.len(),
                trans_id,
                phase
            );

            match phase {
                Phase::Started | Phase::CollectingCommitAcks => {
                    if let Some(tc_oprec) = record.lost_operation() {
                        self.start_abort(handle, AbortReason::ReplicasLost { tc_oprec }, None, &mut fx);
                    } else {
                        self.advance(handle, &mut fx);
                    }
                }
                Phase::CollectingCompleteAcks => self.advance(handle, &mut fx),
                Phase::CollectingAbortAcks => {
                    // The chain may be broken at the failed replica
                    for index in affected {
                        abort_directly(emit, &mut fx, &record.operations[index], trans_id);
                    }
                    self.advance(handle, &mut fx);
                }
                Phase::Done => {}
            }
        }
        fx.finish()
    }

    // === LOOKUP HELPERS ===

    fn handle(&self, trans_id: TransactionId) -> Result<Handle> {
        self.by_transid
            .get(&trans_id)
            .copied()
            .ok_or(CoordinatorError::TransactionNotFound(trans_id))
    }

    fn record_mut(&mut self, handle: Handle) -> Result<&mut TransactionRecord> {
        self.transactions
            .get_mut(handle)
            .map_err(|_| CoordinatorError::Halted(format!("stale transaction handle {}", handle)))
    }

    fn record_checked(
        &mut self,
        handle: Handle,
        trans_id: TransactionId,
    ) -> KernelResult<&mut TransactionRecord> {
        self.transactions
            .get_mut(handle)
            .map_err(|_| ProtocolViolation::UnknownTransaction(trans_id))
    }

    /// Active transaction for an acknowledgement; `None` when it belongs to
    /// a transaction that already finished
    fn locate(&self, trans_id: TransactionId, signal: &'static str) -> KernelResult<Option<Handle>> {
        if let Some(handle) = self.by_transid.get(&trans_id) {
            return Ok(Some(*handle));
        }
        if self.finished.contains(&trans_id) {
            tracing::debug!(
                "[{}] Late {} for finished transaction {}",
                self.name,
                signal,
                trans_id
            );
            return Ok(None);
        }
        Err(ProtocolViolation::UnknownTransaction(trans_id))
    }
}

/// Send Abort to every outstanding replica of `op` instead of its chain head
fn abort_directly(emit: Emitter, fx: &mut Effects, op: &OperationEntry, trans_id: TransactionId) {
    for slot in &op.slots {
        if slot.status == SlotStatus::Outstanding {
            emit.abort(fx, slot.participant, op.tc_oprec, trans_id);
        }
    }
}

fn operation(
    record: &mut TransactionRecord,
    tc_oprec: u32,
    trans_id: TransactionId,
) -> KernelResult<&mut OperationEntry> {
    record
        .operation_mut(tc_oprec)
        .ok_or(ProtocolViolation::UnknownOperation {
            token: tc_oprec,
            trans_id,
        })
}

fn slot_mut(
    record: &mut TransactionRecord,
    tc_oprec: u32,
    sender: BlockRef,
    trans_id: TransactionId,
) -> KernelResult<&mut crate::transaction::Slot> {
    operation(record, tc_oprec, trans_id)?
        .slot_mut(sender)
        .ok_or(ProtocolViolation::NotAMember {
            trans_id,
            token: tc_oprec,
            sender,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::GciClock;
    use kestrel_signal::{Committed, Completed, OperationAck};
    use std::sync::Arc;

    const TRANS: TransactionId = TransactionId::new(1, 42);

    fn tc() -> BlockRef {
        BlockRef::new(NodeId(1), 0x2000)
    }

    fn lqh(node: u16) -> BlockRef {
        BlockRef::new(NodeId(node), 0x1000)
    }

    fn kernel() -> TcKernel {
        TcKernel::new(
            tc(),
            Arc::new(GciClock::starting_at(Gci::new(3, 0))),
            4,
            true,
            16,
        )
    }

    fn started(chains: &[(u32, Vec<BlockRef>)]) -> TcKernel {
        let mut k = kernel();
        let mut plan = TransactionPlan::new(TRANS);
        for (tc_oprec, chain) in chains {
            plan = plan.operation(*tc_oprec, chain.clone());
        }
        k.begin(&plan).unwrap();
        k
    }

    fn committed(tc_oprec: u32) -> ParticipantSignal {
        ParticipantSignal::Committed(Committed(OperationAck {
            tc_connect_ptr: tc_oprec,
            trans_id: TRANS,
        }))
    }

    fn completed(tc_oprec: u32) -> ParticipantSignal {
        ParticipantSignal::Completed(Completed(OperationAck {
            tc_connect_ptr: tc_oprec,
            trans_id: TRANS,
        }))
    }

    fn aborted(tc_oprec: u32, node: u16, last_lqh: bool) -> ParticipantSignal {
        ParticipantSignal::Aborted(Aborted {
            sender_data: tc_oprec,
            trans_id: TRANS,
            node_id: NodeId(node),
            last_lqh,
        })
    }

    fn lqhkeyconf(tc_oprec: u32, node: u16, word: u32) -> ParticipantSignal {
        ParticipantSignal::Packed(vec![PackedSignal::LqhKeyConf(LqhKeyConf {
            lqh_ptr: word,
            tc_oprec,
            user_ref: lqh(node),
            read_len: 0,
            trans_id: TRANS,
            num_fired_triggers: 0,
        })])
    }

    fn destinations(output: &TcOutput) -> Vec<BlockRef> {
        output.out.iter().map(|o| o.to).collect()
    }

    #[test]
    fn test_happy_path() {
        let mut k = started(&[(7, vec![lqh(2)]), (8, vec![lqh(3)])]);

        let output = k.commit(TRANS).unwrap();
        assert_eq!(destinations(&output), vec![lqh(2), lqh(3)]);
        match &output.out[0].signal {
            CoordinatorSignal::CommitReq(req) => {
                assert_eq!(req.tc_oprec, 7);
                assert_eq!(req.gci, Gci::new(3, 0));
                assert_eq!(req.old_blockref, tc());
            }
            other => panic!("expected COMMIT_REQ, got {:?}", other),
        }
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingCommitAcks));

        // Phase gate: one of two acks does not advance
        let output = k.on_signal(lqh(2), committed(7)).unwrap();
        assert!(output.out.is_empty());
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingCommitAcks));

        let output = k.on_signal(lqh(3), committed(8)).unwrap();
        assert_eq!(output.out.len(), 2);
        assert!(
            output
                .out
                .iter()
                .all(|o| matches!(o.signal, CoordinatorSignal::CompleteReq(_)))
        );
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingCompleteAcks));

        k.on_signal(lqh(2), completed(7)).unwrap();
        let output = k.on_signal(lqh(3), completed(8)).unwrap();
        assert_eq!(
            output.finished,
            vec![(
                TRANS,
                TransactionOutcome::Committed {
                    gci: Gci::new(3, 0)
                }
            )]
        );
        assert!(output.out.iter().all(|o| matches!(
            &o.signal,
            CoordinatorSignal::Packed(signals)
                if matches!(signals[0], PackedSignal::RemoveMarker { .. })
        )));
        assert_eq!(k.active_transactions(), 0);

        // Late duplicates are absorbed
        assert!(k.on_signal(lqh(2), completed(7)).unwrap().out.is_empty());
    }

    #[test]
    fn test_unpacked_config_still_packs_remove_marker() {
        let mut k = TcKernel::new(
            tc(),
            Arc::new(GciClock::starting_at(Gci::new(3, 0))),
            4,
            false,
            16,
        );
        k.begin(&TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]))
            .unwrap();
        k.on_signal(lqh(2), lqhkeyconf(7, 2, 0x10)).unwrap();

        let output = k.commit(TRANS).unwrap();
        assert!(matches!(
            output.out[0].signal,
            CoordinatorSignal::CommitReq(_)
        ));
        let output = k.on_signal(lqh(2), committed(7)).unwrap();
        assert!(matches!(
            output.out[0].signal,
            CoordinatorSignal::CompleteReq(_)
        ));

        let output = k.on_signal(lqh(2), completed(7)).unwrap();
        assert!(output.finished[0].1.is_committed());
        assert_eq!(destinations(&output), vec![lqh(2)]);
        assert!(matches!(
            &output.out[0].signal,
            CoordinatorSignal::Packed(signals)
                if signals == &vec![PackedSignal::RemoveMarker { fail_api: false, trans_id: TRANS }]
        ));
    }

    #[test]
    fn test_packed_commit_when_record_word_is_known() {
        let mut k = started(&[(7, vec![lqh(2)]), (8, vec![lqh(2)])]);
        k.on_signal(lqh(2), lqhkeyconf(7, 2, 0x10)).unwrap();
        k.on_signal(lqh(2), lqhkeyconf(8, 2, 0x11)).unwrap();

        let output = k.commit(TRANS).unwrap();
        assert_eq!(output.out.len(), 1);
        match &output.out[0].signal {
            CoordinatorSignal::Packed(signals) => {
                assert_eq!(signals.len(), 2);
                assert!(matches!(
                    signals[0],
                    PackedSignal::Commit { lqh_ptr: 0x10, .. }
                ));
            }
            other => panic!("expected packed COMMIT, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_ack_is_absorbed() {
        let mut k = started(&[(7, vec![lqh(2)]), (8, vec![lqh(3)])]);
        k.commit(TRANS).unwrap();
        k.on_signal(lqh(2), committed(7)).unwrap();
        let output = k.on_signal(lqh(2), committed(7)).unwrap();
        assert!(output.out.is_empty());
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingCommitAcks));
    }

    #[test]
    fn test_accounting_violations() {
        let mut k = started(&[(7, vec![lqh(2)])]);

        // Nothing requested yet
        assert!(matches!(
            k.on_signal(lqh(2), committed(7)),
            Err(ProtocolViolation::NoOutstandingRequest { .. })
        ));

        k.commit(TRANS).unwrap();
        assert!(matches!(
            k.on_signal(lqh(4), committed(7)),
            Err(ProtocolViolation::NotAMember { .. })
        ));
        assert!(matches!(
            k.on_signal(lqh(2), committed(9)),
            Err(ProtocolViolation::UnknownOperation { token: 9, .. })
        ));

        let stranger = ParticipantSignal::Committed(Committed(OperationAck {
            tc_connect_ptr: 7,
            trans_id: TransactionId::new(5, 5),
        }));
        assert!(matches!(
            k.on_signal(lqh(2), stranger),
            Err(ProtocolViolation::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_commit_ref_aborts_everywhere() {
        let mut k = started(&[(7, vec![lqh(2)]), (8, vec![lqh(3)])]);
        k.commit(TRANS).unwrap();
        k.on_signal(lqh(3), committed(8)).unwrap();

        let refusal = ParticipantSignal::CommitRef(kestrel_signal::CommitRef(NodeRef {
            tc_connect_ptr: 7,
            sender_node_id: NodeId(2),
            trans_id: TRANS,
            error_code: 630,
        }));
        let output = k.on_signal(lqh(2), refusal).unwrap();
        assert_eq!(destinations(&output), vec![lqh(3)]);
        assert!(matches!(output.out[0].signal, CoordinatorSignal::Abort(_)));
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingAbortAcks));

        let output = k.on_signal(lqh(3), aborted(8, 3, true)).unwrap();
        assert_eq!(
            output.finished,
            vec![(
                TRANS,
                TransactionOutcome::Aborted {
                    reason: AbortReason::CommitRefused {
                        node: NodeId(2),
                        error_code: 630
                    }
                }
            )]
        );
    }

    #[test]
    fn test_abort_goes_to_chain_head_and_last_implies_chain() {
        let mut k = started(&[(7, vec![lqh(2), lqh(3)])]);
        k.on_signal(lqh(2), lqhkeyconf(7, 2, 1)).unwrap();
        k.on_signal(lqh(3), lqhkeyconf(7, 3, 1)).unwrap();

        let output = k.abort(TRANS, AbortReason::Requested).unwrap();
        assert_eq!(destinations(&output), vec![lqh(2)]);

        // Tail answers before the head: the whole chain is done
        let output = k.on_signal(lqh(3), aborted(7, 3, true)).unwrap();
        assert_eq!(output.finished.len(), 1);

        // Head's reply arrives after the record is gone
        assert!(k.on_signal(lqh(2), aborted(7, 2, false)).is_ok());
    }

    #[test]
    fn test_abort_without_known_records_goes_direct() {
        let mut k = started(&[(7, vec![lqh(2), lqh(3)])]);
        let output = k.abort(TRANS, AbortReason::Requested).unwrap();
        assert_eq!(destinations(&output), vec![lqh(2), lqh(3)]);

        k.on_signal(lqh(2), aborted(7, 2, false)).unwrap();
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingAbortAcks));
        let output = k.on_signal(lqh(3), aborted(7, 3, true)).unwrap();
        assert_eq!(output.finished.len(), 1);
    }

    #[test]
    fn test_abort_after_commit_point_is_refused() {
        let mut k = started(&[(7, vec![lqh(2)])]);
        k.commit(TRANS).unwrap();
        k.on_signal(lqh(2), committed(7)).unwrap();
        assert!(matches!(
            k.abort(TRANS, AbortReason::Requested),
            Err(CoordinatorError::InvalidState {
                phase: Phase::CollectingCompleteAcks,
                ..
            })
        ));
    }

    #[test]
    fn test_node_failure_excludes_slots() {
        let mut k = started(&[(7, vec![lqh(2), lqh(3)])]);
        k.commit(TRANS).unwrap();
        k.on_signal(lqh(2), committed(7)).unwrap();

        let output = k.on_node_failure(NodeId(3));
        assert_eq!(destinations(&output), vec![lqh(2)]);
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingCompleteAcks));

        let output = k.on_signal(lqh(2), completed(7)).unwrap();
        assert!(output.finished[0].1.is_committed());
    }

    #[test]
    fn test_losing_every_replica_aborts() {
        let mut k = started(&[(7, vec![lqh(2)]), (8, vec![lqh(3)])]);
        k.commit(TRANS).unwrap();

        let output = k.on_node_failure(NodeId(2));
        assert_eq!(k.phase(TRANS), Some(Phase::CollectingAbortAcks));
        assert_eq!(destinations(&output), vec![lqh(3)]);

        let output = k.on_signal(lqh(3), aborted(8, 3, true)).unwrap();
        assert_eq!(
            output.finished[0].1,
            TransactionOutcome::Aborted {
                reason: AbortReason::ReplicasLost { tc_oprec: 7 }
            }
        );

        // Failed nodes are refused for new transactions
        let plan = TransactionPlan::new(TransactionId::new(1, 43)).operation(9, vec![lqh(2)]);
        assert_eq!(
            k.begin(&plan),
            Err(CoordinatorError::ReplicaUnavailable(NodeId(2)))
        );
    }

    #[test]
    fn test_broken_abort_chain_is_repaired() {
        let mut k = started(&[(7, vec![lqh(2), lqh(3), lqh(4)])]);
        for node in [2, 3, 4] {
            k.on_signal(lqh(node), lqhkeyconf(7, node, 1)).unwrap();
        }
        k.abort(TRANS, AbortReason::Requested).unwrap();
        k.on_signal(lqh(2), aborted(7, 2, false)).unwrap();

        // Middle replica dies before forwarding
        let output = k.on_node_failure(NodeId(3));
        assert_eq!(destinations(&output), vec![lqh(4)]);
        let output = k.on_signal(lqh(4), aborted(7, 4, true)).unwrap();
        assert_eq!(output.finished.len(), 1);
    }

    #[test]
    fn test_pool_exhaustion_and_duplicates() {
        let mut k = kernel();
        for i in 0..4 {
            k.begin(&TransactionPlan::new(TransactionId::new(1, i)).operation(i, vec![lqh(2)]))
                .unwrap();
        }
        let plan = TransactionPlan::new(TransactionId::new(1, 9)).operation(9, vec![lqh(2)]);
        assert_eq!(
            k.begin(&plan),
            Err(CoordinatorError::PoolExhausted { capacity: 4 })
        );

        let mut k = kernel();
        k.begin(&TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]))
            .unwrap();
        assert_eq!(
            k.begin(&TransactionPlan::new(TRANS)),
            Err(CoordinatorError::DuplicateTransaction(TRANS))
        );
        assert!(matches!(
            k.begin(&TransactionPlan::new(TransactionId::new(1, 43)).operation(7, vec![lqh(3)])),
            Err(CoordinatorError::DuplicateOperation { tc_oprec: 7, .. })
        ));
        assert!(matches!(
            k.begin(&TransactionPlan::new(TransactionId::new(1, 44)).operation(8, vec![])),
            Err(CoordinatorError::EmptyReplicaChain { tc_oprec: 8, .. })
        ));
    }

    #[test]
    fn test_abort_all() {
        let mut k = kernel();
        k.begin(&TransactionPlan::new(TransactionId::new(1, 1)).operation(1, vec![lqh(2)]))
            .unwrap();
        k.begin(&TransactionPlan::new(TransactionId::new(1, 2)).operation(2, vec![lqh(2)]))
            .unwrap();
        k.commit(TransactionId::new(1, 2)).unwrap();

        let (count, output) = k.abort_all();
        assert_eq!(count, 2);
        assert_eq!(output.out.len(), 2);
    }

    #[test]
    fn test_empty_transaction_commits_immediately() {
        let mut k = kernel();
        k.begin(&TransactionPlan::new(TRANS)).unwrap();
        let output = k.commit(TRANS).unwrap();
        assert!(output.finished[0].1.is_committed());
    }
}
