//! Participant thread kernel - commit/abort processing without I/O
//!
//! One kernel per receive thread. It owns the thread's operation records and
//! its view of the store, applies one signal at a time and hands back the
//! signals to send. The node runtime owns the inbox, the sending and the
//! halting on protocol violations.

use crate::config::ParticipantConfig;
use crate::error::{ParticipantError, Result};
use crate::operation::{
    AbortReply, CommitMarker, FinishedOperation, FinishedOutcome, OperationKey, OperationRecord,
    OperationState, PrepareRequest,
};
use crate::store::TupleStore;
use kestrel_common::{Arena, BlockRef, Gci, Handle, NodeId, ThreadId, TransactionId};
use kestrel_engine::Inbound;
use kestrel_signal::packed::{self, TOKEN_MASK};
use kestrel_signal::{
    Abort, AbortRouting, Aborted, CommitConf, CommitRef, CommitReq, CompleteConf, CompleteRef,
    CompleteReq, Completed, Committed, CoordinatorSignal, Direction, LqhKeyConf, NodeConf,
    NodeRef, OperationAck, PackedSignal, ParticipantSignal, ProtocolViolation, PushAbortTrainOrd,
    RouterRequest, RouterSignal, SendPushAbortConf, SendPushAbortReq, SignalError, SignalFrame,
};
use std::collections::{HashMap, VecDeque};

type KernelResult<T> = std::result::Result<T, ProtocolViolation>;

/// A signal the kernel wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Acknowledgement to a coordinator
    Coordinator {
        to: BlockRef,
        signal: ParticipantSignal,
    },
    /// Abort forwarded along the replica chain
    Replica {
        to: BlockRef,
        signal: CoordinatorSignal,
    },
    /// Push-abort request to the node's routing agent
    Router { to: BlockRef, request: RouterRequest },
}

impl Outbound {
    pub fn to(&self) -> BlockRef {
        match self {
            Outbound::Coordinator { to, .. }
            | Outbound::Replica { to, .. }
            | Outbound::Router { to, .. } => *to,
        }
    }

    pub fn to_frame(&self, sender: BlockRef) -> std::result::Result<SignalFrame, SignalError> {
        match self {
            Outbound::Coordinator { signal, .. } => signal.to_frame(sender),
            Outbound::Replica { signal, .. } => signal.to_frame(sender),
            Outbound::Router { request, .. } => Ok(request.to_frame(sender)),
        }
    }
}

/// Form of the request being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckStyle {
    Standalone,
    Packed,
}

/// Where and how an acknowledgement goes
#[derive(Debug, Clone, Copy)]
struct AckTarget {
    to: BlockRef,
    tc_connect_ptr: u32,
    handoff: bool,
    style: AckStyle,
}

/// Signals produced while handling one inbound signal; packed acknowledgements
/// are grouped per destination and flushed at the end
#[derive(Default)]
struct Effects {
    out: Vec<Outbound>,
    packed: Vec<(BlockRef, Vec<PackedSignal>)>,
}

impl Effects {
    fn send(&mut self, outbound: Outbound) {
        self.out.push(outbound);
    }

    fn pack(&mut self, to: BlockRef, signal: PackedSignal) {
        match self.packed.iter_mut().find(|(dest, _)| *dest == to) {
            Some((_, signals)) => signals.push(signal),
            None => self.packed.push((to, vec![signal])),
        }
    }

    fn finish(mut self) -> Vec<Outbound> {
        for (to, signals) in self.packed {
            for batch in packed::batch(signals) {
                self.out.push(Outbound::Coordinator {
                    to,
                    signal: ParticipantSignal::Packed(batch),
                });
            }
        }
        self.out
    }
}

/// Reference a thread holds on behalf of an operation owned elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldReference {
    pub trans_id: TransactionId,
    pub owner: BlockRef,
}

/// Commit/abort kernel of one participant receive thread
pub struct ParticipantKernel<S: TupleStore> {
    /// This thread's address
    address: BlockRef,

    thread: ThreadId,

    /// Routing agent of this node
    router: BlockRef,

    store: S,

    use_packed: bool,

    records: Arena<OperationRecord>,

    by_key: HashMap<OperationKey, Handle>,

    /// References held for operations owned by sibling threads
    held: HashMap<OperationKey, HeldReference>,

    /// Recently released operations, oldest first
    history: VecDeque<FinishedOperation>,

    history_limit: usize,

    markers: HashMap<TransactionId, CommitMarker>,

    signal_id: u32,

    /// Log prefix
    name: String,
}

impl<S: TupleStore> ParticipantKernel<S> {
    pub fn new(
        address: BlockRef,
        thread: ThreadId,
        router: BlockRef,
        store: S,
        config: &ParticipantConfig,
    ) -> Self {
        let name = format!("lqh {} {}", address, thread);
        tracing::info!(
            "[{}] Kernel initialized over store {} with {} operation records",
            name,
            store.store_name(),
            config.operation_pool_capacity
        );

        Self {
            address,
            thread,
            router,
            store,
            use_packed: config.use_packed_signals,
            records: Arena::with_capacity(config.operation_pool_capacity),
            by_key: HashMap::new(),
            held: HashMap::new(),
            history: VecDeque::new(),
            history_limit: config.finished_history,
            markers: HashMap::new(),
            signal_id: 0,
            name,
        }
    }

    pub fn address(&self) -> BlockRef {
        self.address
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Operation records currently seized
    pub fn active_operations(&self) -> usize {
        self.records.len()
    }

    pub fn operation(&self, origin_ref: BlockRef, tc_oprec: u32) -> Option<&OperationRecord> {
        let handle = self.by_key.get(&OperationKey {
            origin_ref,
            tc_oprec,
        })?;
        self.records.get(*handle).ok()
    }

    pub fn marker(&self, trans_id: TransactionId) -> Option<&CommitMarker> {
        self.markers.get(&trans_id)
    }

    pub fn held_references(&self) -> usize {
        self.held.len()
    }

    /// Transactions committed here whose coordinator failed before completing
    pub fn in_doubt(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self
            .markers
            .iter()
            .filter(|(_, marker)| marker.in_doubt)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn next_signal_id(&mut self) -> u32 {
        self.signal_id = self.signal_id.wrapping_add(1);
        self.signal_id
    }

    // === PREPARE ===

    /// Seize a record for a prepared operation.
    ///
    /// Returns the record word the coordinator uses in short commit and
    /// complete signals, and the LQHKEYCONF announcing it.
    pub fn prepare(&mut self, request: &PrepareRequest) -> Result<(u32, Vec<Outbound>)> {
        let position = request
            .chain
            .iter()
            .position(|replica| *replica == self.address)
            .ok_or(ParticipantError::NotInChain(self.address))?;

        let record = OperationRecord::prepared(request, position);
        let key = record.key();
        if self.by_key.contains_key(&key) {
            return Err(ParticipantError::DuplicateOperation {
                trans_id: request.trans_id,
                tc_oprec: request.tc_oprec,
            });
        }

        let handle = self
            .records
            .seize(record)
            .map_err(|_| ParticipantError::PoolExhausted {
                capacity: self.records.capacity(),
            })?;
        self.by_key.insert(key, handle);
        let word = handle.to_word();

        tracing::debug!(
            "[{}] Prepared operation {} of {} as {} ({} of {} replicas)",
            self.name,
            request.tc_oprec,
            request.trans_id,
            handle,
            position + 1,
            request.chain.len()
        );

        let mut out = Vec::new();
        if self.use_packed && request.tc_oprec <= TOKEN_MASK {
            out.push(Outbound::Coordinator {
                to: request.tc_ref,
                signal: ParticipantSignal::Packed(vec![PackedSignal::LqhKeyConf(LqhKeyConf {
                    lqh_ptr: word,
                    tc_oprec: request.tc_oprec,
                    user_ref: self.address,
                    read_len: 0,
                    trans_id: request.trans_id,
                    num_fired_triggers: 0,
                })]),
            });
        }
        Ok((word, out))
    }

    /// Hold a reference for an operation owned by a sibling thread
    pub fn hold_reference(&mut self, key: OperationKey, trans_id: TransactionId, owner: BlockRef) {
        self.held.insert(key, HeldReference { trans_id, owner });
    }

    // === SIGNAL DISPATCH ===

    /// Apply one delivery
    pub fn on_inbound(&mut self, inbound: &Inbound) -> KernelResult<Vec<Outbound>> {
        match inbound {
            Inbound::Signal(frame) => self.on_frame(frame),
            Inbound::NodeFailed(node) => Ok(self.on_node_failure(*node)),
        }
    }

    pub fn on_frame(&mut self, frame: &SignalFrame) -> KernelResult<Vec<Outbound>> {
        let malformed = |source| ProtocolViolation::Malformed {
            sender: frame.sender,
            source,
        };
        let mut fx = Effects::default();
        match frame.gsn.direction() {
            Direction::FromRouter => {
                let signal = RouterSignal::decode(frame).map_err(malformed)?;
                self.on_router_signal(signal, &mut fx)?;
            }
            _ => {
                let signal = CoordinatorSignal::decode(frame).map_err(malformed)?;
                self.on_coordinator_signal(signal, &mut fx)?;
            }
        }
        Ok(fx.finish())
    }

    pub fn on_coordinator_signal_now(
        &mut self,
        signal: CoordinatorSignal,
    ) -> KernelResult<Vec<Outbound>> {
        let mut fx = Effects::default();
        self.on_coordinator_signal(signal, &mut fx)?;
        Ok(fx.finish())
    }

    pub fn on_router_signal_now(&mut self, signal: RouterSignal) -> KernelResult<Vec<Outbound>> {
        let mut fx = Effects::default();
        self.on_router_signal(signal, &mut fx)?;
        Ok(fx.finish())
    }

    fn on_coordinator_signal(
        &mut self,
        signal: CoordinatorSignal,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        match signal {
            CoordinatorSignal::CommitReq(req) => self.on_commit_req(req, fx),
            CoordinatorSignal::Commit(commit) => self.on_commit(
                commit.tc_connect_ptr,
                commit.gci,
                commit.trans_id,
                AckStyle::Standalone,
                fx,
            ),
            CoordinatorSignal::CompleteReq(req) => self.on_complete_req(req, fx),
            CoordinatorSignal::Complete(complete) => self.on_complete(
                complete.0.tc_connect_ptr,
                complete.0.trans_id,
                AckStyle::Standalone,
                fx,
            ),
            CoordinatorSignal::Abort(abort) => self.on_abort(abort, fx),
            CoordinatorSignal::Packed(signals) => self.on_packed(signals, fx),
        }
    }

    fn on_packed(&mut self, signals: Vec<PackedSignal>, fx: &mut Effects) -> KernelResult<()> {
        for signal in signals {
            match signal {
                PackedSignal::Commit {
                    lqh_ptr,
                    gci,
                    trans_id,
                } => self.on_commit(lqh_ptr, gci, trans_id, AckStyle::Packed, fx)?,
                PackedSignal::Complete { lqh_ptr, trans_id } => {
                    self.on_complete(lqh_ptr, trans_id, AckStyle::Packed, fx)?
                }
                PackedSignal::RemoveMarker { fail_api, trans_id } => {
                    self.remove_marker(trans_id, fail_api)
                }
                other => {
                    return Err(ProtocolViolation::InvalidTransition {
                        signal: other.tag().name(),
                        trans_id: other.trans_id(),
                        state: "packed to participant".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    // === COMMIT ===

    fn on_commit_req(&mut self, req: CommitReq, fx: &mut Effects) -> KernelResult<()> {
        let key = OperationKey {
            origin_ref: req.old_blockref,
            tc_oprec: req.tc_oprec,
        };
        let target = AckTarget {
            to: req.req_blockref,
            tc_connect_ptr: req.req_ptr,
            handoff: req.is_handoff(),
            style: AckStyle::Standalone,
        };

        match self.by_key.get(&key).copied() {
            Some(handle) => {
                self.check_transaction(handle, req.tc_oprec, req.trans_id)?;
                if req.is_handoff() {
                    self.rehome(handle, req.req_blockref);
                }
                self.commit_record(handle, req.gci, target, fx)
            }
            None => {
                let finished = self.finished_by_key(key, req.trans_id);
                self.replay_commit(finished, req.tc_oprec, req.trans_id, target, fx)
            }
        }
    }

    fn on_commit(
        &mut self,
        word: u32,
        gci: Gci,
        trans_id: TransactionId,
        style: AckStyle,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        match self.records.resolve_word(word) {
            Ok(handle) => {
                self.check_transaction(handle, word, trans_id)?;
                let record = self.record(handle, word, trans_id)?;
                let target = AckTarget {
                    to: record.tc_ref,
                    tc_connect_ptr: record.tc_oprec,
                    handoff: false,
                    style,
                };
                self.commit_record(handle, gci, target, fx)
            }
            Err(_) => match self.finished_by_word(word, trans_id)? {
                Some(finished) => {
                    let target = AckTarget {
                        to: finished.tc_ref,
                        tc_connect_ptr: finished.key.tc_oprec,
                        handoff: false,
                        style,
                    };
                    self.replay_commit(Some(finished), word, trans_id, target, fx)
                }
                None => Err(ProtocolViolation::UnknownOperation {
                    token: word,
                    trans_id,
                }),
            },
        }
    }

    fn commit_record(
        &mut self,
        handle: Handle,
        gci: Gci,
        target: AckTarget,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let record = self.record(handle, target.tc_connect_ptr, TransactionId::new(0, 0))?;
        let (state, trans_id, op, tc_ref) = (
            record.state,
            record.trans_id,
            record.store_op(),
            record.tc_ref,
        );

        match state {
            OperationState::Idle => {
                self.set_state(handle, OperationState::CommitPending);
                match self.store.commit(op, gci) {
                    Ok(()) => {
                        if let Ok(record) = self.records.get_mut(handle) {
                            record.state = OperationState::Committed;
                            record.gci = Some(gci);
                        }
                        let marker = self.markers.entry(trans_id).or_insert(CommitMarker {
                            tc_ref,
                            gci,
                            operations: 0,
                            in_doubt: false,
                        });
                        marker.operations += 1;
                        tracing::debug!(
                            "[{}] Committed operation {} of {} at GCI {}",
                            self.name,
                            op.tc_oprec,
                            trans_id,
                            gci
                        );
                        self.ack_commit(target, trans_id, fx);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(
                            "[{}] Store rejected commit of operation {} of {}: {}",
                            self.name,
                            op.tc_oprec,
                            trans_id,
                            e
                        );
                        let reply = AbortReply::CommitRef {
                            to: target.to,
                            req_ptr: target.tc_connect_ptr,
                            error_code: e.code,
                        };
                        self.begin_abort(handle, reply, fx)
                    }
                }
            }
            OperationState::Committed
            | OperationState::CompletePending
            | OperationState::Completed => {
                tracing::debug!(
                    "[{}] Duplicate commit of operation {} of {}, acknowledging again",
                    self.name,
                    op.tc_oprec,
                    trans_id
                );
                self.ack_commit(target, trans_id, fx);
                Ok(())
            }
            OperationState::CommitPending => Ok(()),
            OperationState::Aborting | OperationState::Aborted => {
                Err(ProtocolViolation::InvalidTransition {
                    signal: "COMMIT",
                    trans_id,
                    state: state.to_string(),
                })
            }
        }
    }

    fn replay_commit(
        &mut self,
        finished: Option<FinishedOperation>,
        token: u32,
        trans_id: TransactionId,
        target: AckTarget,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        match finished.map(|f| f.outcome) {
            Some(FinishedOutcome::Completed { .. }) => {
                tracing::debug!(
                    "[{}] Late commit for finished operation {} of {}",
                    self.name,
                    token,
                    trans_id
                );
                self.ack_commit(target, trans_id, fx);
                Ok(())
            }
            Some(FinishedOutcome::Aborted {
                commit_error: Some(error_code),
                ..
            }) => {
                fx.send(Outbound::Coordinator {
                    to: target.to,
                    signal: ParticipantSignal::CommitRef(CommitRef(NodeRef {
                        tc_connect_ptr: target.tc_connect_ptr,
                        sender_node_id: self.address.node(),
                        trans_id,
                        error_code,
                    })),
                });
                Ok(())
            }
            Some(FinishedOutcome::Aborted { .. }) => Err(ProtocolViolation::InvalidTransition {
                signal: "COMMIT",
                trans_id,
                state: OperationState::Aborted.to_string(),
            }),
            None => Err(ProtocolViolation::UnknownOperation { token, trans_id }),
        }
    }

    fn ack_commit(&self, target: AckTarget, trans_id: TransactionId, fx: &mut Effects) {
        if target.handoff {
            fx.send(Outbound::Coordinator {
                to: target.to,
                signal: ParticipantSignal::CommitConf(CommitConf(NodeConf {
                    tc_connect_ptr: target.tc_connect_ptr,
                    sender_node_id: self.address.node(),
                    trans_id,
                })),
            });
        } else if self.packs(target) {
            fx.pack(
                target.to,
                PackedSignal::Committed {
                    tc_oprec: target.tc_connect_ptr,
                    trans_id,
                },
            );
        } else {
            fx.send(Outbound::Coordinator {
                to: target.to,
                signal: ParticipantSignal::Committed(Committed(OperationAck {
                    tc_connect_ptr: target.tc_connect_ptr,
                    trans_id,
                })),
            });
        }
    }

    fn packs(&self, target: AckTarget) -> bool {
        self.use_packed && target.style == AckStyle::Packed && target.tc_connect_ptr <= TOKEN_MASK
    }

    // === COMPLETE ===

    fn on_complete_req(&mut self, req: CompleteReq, fx: &mut Effects) -> KernelResult<()> {
        let key = OperationKey {
            origin_ref: req.old_blockref,
            tc_oprec: req.tc_oprec,
        };
        let target = AckTarget {
            to: req.req_blockref,
            tc_connect_ptr: req.req_ptr,
            handoff: req.is_handoff(),
            style: AckStyle::Standalone,
        };

        match self.by_key.get(&key).copied() {
            Some(handle) => {
                self.check_transaction(handle, req.tc_oprec, req.trans_id)?;
                if req.is_handoff() {
                    self.rehome(handle, req.req_blockref);
                }
                self.complete_record(handle, target, fx)
            }
            None => {
                let finished = self.finished_by_key(key, req.trans_id);
                self.replay_complete(finished, req.tc_oprec, req.trans_id, target, fx)
            }
        }
    }

    fn on_complete(
        &mut self,
        word: u32,
        trans_id: TransactionId,
        style: AckStyle,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        match self.records.resolve_word(word) {
            Ok(handle) => {
                self.check_transaction(handle, word, trans_id)?;
                let record = self.record(handle, word, trans_id)?;
                let target = AckTarget {
                    to: record.tc_ref,
                    tc_connect_ptr: record.tc_oprec,
                    handoff: false,
                    style,
                };
                self.complete_record(handle, target, fx)
            }
            Err(_) => {
                let finished = self.finished_by_word(word, trans_id)?;
                match finished {
                    Some(f) => {
                        let target = AckTarget {
                            to: f.tc_ref,
                            tc_connect_ptr: f.key.tc_oprec,
                            handoff: false,
                            style,
                        };
                        self.replay_complete(Some(f), word, trans_id, target, fx)
                    }
                    None => Err(ProtocolViolation::UnknownOperation {
                        token: word,
                        trans_id,
                    }),
                }
            }
        }
    }

    fn complete_record(
        &mut self,
        handle: Handle,
        target: AckTarget,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let record = self.record(handle, target.tc_connect_ptr, TransactionId::new(0, 0))?;
        let (state, trans_id, op, gci) = (
            record.state,
            record.trans_id,
            record.store_op(),
            record.gci.unwrap_or(Gci::ZERO),
        );

        match state {
            OperationState::Committed => {
                self.set_state(handle, OperationState::CompletePending);
                match self.store.complete(op) {
                    Ok(()) => {
                        self.set_state(handle, OperationState::Completed);
                        self.finish_record(handle, FinishedOutcome::Completed { gci });
                        tracing::debug!(
                            "[{}] Completed operation {} of {}",
                            self.name,
                            op.tc_oprec,
                            trans_id
                        );
                        self.ack_complete(target, trans_id, fx);
                    }
                    Err(e) => {
                        self.set_state(handle, OperationState::Committed);
                        tracing::error!(
                            "[{}] Store failed to complete operation {} of {}: {}",
                            self.name,
                            op.tc_oprec,
                            trans_id,
                            e
                        );
                        fx.send(Outbound::Coordinator {
                            to: target.to,
                            signal: ParticipantSignal::CompleteRef(CompleteRef(NodeRef {
                                tc_connect_ptr: target.tc_connect_ptr,
                                sender_node_id: self.address.node(),
                                trans_id,
                                error_code: e.code,
                            })),
                        });
                    }
                }
                Ok(())
            }
            OperationState::CompletePending | OperationState::Completed => {
                self.ack_complete(target, trans_id, fx);
                Ok(())
            }
            _ => Err(ProtocolViolation::InvalidTransition {
                signal: "COMPLETE",
                trans_id,
                state: state.to_string(),
            }),
        }
    }

    fn replay_complete(
        &mut self,
        finished: Option<FinishedOperation>,
        token: u32,
        trans_id: TransactionId,
        target: AckTarget,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        match finished.map(|f| f.outcome) {
            Some(FinishedOutcome::Completed { .. }) => {
                tracing::debug!(
                    "[{}] Duplicate complete of finished operation {} of {}",
                    self.name,
                    token,
                    trans_id
                );
                self.ack_complete(target, trans_id, fx);
                Ok(())
            }
            Some(FinishedOutcome::Aborted { .. }) => Err(ProtocolViolation::InvalidTransition {
                signal: "COMPLETE",
                trans_id,
                state: OperationState::Aborted.to_string(),
            }),
            None => Err(ProtocolViolation::UnknownOperation { token, trans_id }),
        }
    }

    fn ack_complete(&self, target: AckTarget, trans_id: TransactionId, fx: &mut Effects) {
        if target.handoff {
            fx.send(Outbound::Coordinator {
                to: target.to,
                signal: ParticipantSignal::CompleteConf(CompleteConf(NodeConf {
                    tc_connect_ptr: target.tc_connect_ptr,
                    sender_node_id: self.address.node(),
                    trans_id,
                })),
            });
        } else if self.packs(target) {
            fx.pack(
                target.to,
                PackedSignal::Completed {
                    tc_oprec: target.tc_connect_ptr,
                    trans_id,
                },
            );
        } else {
            fx.send(Outbound::Coordinator {
                to: target.to,
                signal: ParticipantSignal::Completed(Completed(OperationAck {
                    tc_connect_ptr: target.tc_connect_ptr,
                    trans_id,
                })),
            });
        }
    }

    // === ABORT ===

    fn on_abort(&mut self, abort: Abort, fx: &mut Effects) -> KernelResult<()> {
        let key = OperationKey {
            origin_ref: abort.tc_blockref,
            tc_oprec: abort.tc_oprec,
        };

        let Some(handle) = self.by_key.get(&key).copied() else {
            return self.replay_abort(key, abort, fx);
        };

        self.check_transaction(handle, abort.tc_oprec, abort.trans_id)?;
        let state = self.record(handle, abort.tc_oprec, abort.trans_id)?.state;
        match state {
            OperationState::Idle
            | OperationState::CommitPending
            | OperationState::Committed
            | OperationState::CompletePending => {
                self.begin_abort(handle, AbortReply::Aborted { forward: true }, fx)
            }
            OperationState::Aborting => {
                tracing::debug!(
                    "[{}] Abort of operation {} of {} already in progress",
                    self.name,
                    abort.tc_oprec,
                    abort.trans_id
                );
                Ok(())
            }
            OperationState::Completed | OperationState::Aborted => {
                Err(ProtocolViolation::InvalidTransition {
                    signal: "ABORT",
                    trans_id: abort.trans_id,
                    state: state.to_string(),
                })
            }
        }
    }

    fn replay_abort(&mut self, key: OperationKey, abort: Abort, fx: &mut Effects) -> KernelResult<()> {
        let finished = self.finished_by_key(key, abort.trans_id);
        match finished {
            Some(FinishedOperation {
                outcome: FinishedOutcome::Aborted { last_replica, .. },
                tc_ref,
                ..
            }) => {
                tracing::debug!(
                    "[{}] Duplicate abort of finished operation {} of {}",
                    self.name,
                    abort.tc_oprec,
                    abort.trans_id
                );
                self.reply_aborted(tc_ref, abort.tc_oprec, abort.trans_id, last_replica, fx);
                Ok(())
            }
            Some(_) => Err(ProtocolViolation::InvalidTransition {
                signal: "ABORT",
                trans_id: abort.trans_id,
                state: OperationState::Completed.to_string(),
            }),
            None => {
                // Never prepared here; nothing to roll back
                tracing::debug!(
                    "[{}] Abort for unknown operation {} of {}",
                    self.name,
                    abort.tc_oprec,
                    abort.trans_id
                );
                self.reply_aborted(abort.tc_blockref, abort.tc_oprec, abort.trans_id, false, fx);
                Ok(())
            }
        }
    }

    fn begin_abort(
        &mut self,
        handle: Handle,
        reply: AbortReply,
        fx: &mut Effects,
    ) -> KernelResult<()> {
        let signal_id = self.next_signal_id();
        let record = self
            .records
            .get_mut(handle)
            .map_err(|_| ProtocolViolation::UnknownOperation {
                token: handle.to_word(),
                trans_id: TransactionId::new(0, 0),
            })?;
        record.state = OperationState::Aborting;
        record.pending_abort = Some(reply);

        if record.siblings.is_empty() {
            return self.finish_abort(handle, fx);
        }

        let request = SendPushAbortReq {
            tc_oprec: record.tc_oprec,
            tc_blockref: record.origin_ref,
            trans_id: record.trans_id,
            sender_ref: self.address,
            send_thread_signal_id: signal_id,
            thread_id: self.thread,
            thread_ids: record.siblings.clone(),
        };
        tracing::debug!(
            "[{}] Pushing abort of operation {} of {} to {} sibling threads",
            self.name,
            request.tc_oprec,
            request.trans_id,
            request.thread_ids.len()
        );
        fx.send(Outbound::Router {
            to: self.router,
            request: RouterRequest::SendPushAbortReq(request),
        });
        Ok(())
    }

    fn finish_abort(&mut self, handle: Handle, fx: &mut Effects) -> KernelResult<()> {
        let record = self
            .records
            .get(handle)
            .map_err(|_| ProtocolViolation::UnknownOperation {
                token: handle.to_word(),
                trans_id: TransactionId::new(0, 0),
            })?
            .clone();

        self.store.rollback(record.store_op());
        if record.gci.is_some() {
            self.drop_marker_operation(record.trans_id);
        }

        let outcome = match record
            .pending_abort
            .unwrap_or(AbortReply::Aborted { forward: true })
        {
            AbortReply::Aborted { forward } => {
                if forward && let Some(next) = record.next_replica {
                    let abort = Abort {
                        tc_oprec: record.tc_oprec,
                        tc_blockref: record.origin_ref,
                        trans_id: record.trans_id,
                        routing: AbortRouting::Distributed {
                            instance_key: next.block() as u32,
                            thread_id: self.thread,
                            sender_thread_signal_id: self.next_signal_id(),
                        },
                    };
                    fx.send(Outbound::Replica {
                        to: next,
                        signal: CoordinatorSignal::Abort(abort),
                    });
                }
                self.reply_aborted(
                    record.tc_ref,
                    record.tc_oprec,
                    record.trans_id,
                    record.last_replica,
                    fx,
                );
                FinishedOutcome::Aborted {
                    last_replica: record.last_replica,
                    commit_error: None,
                }
            }
            AbortReply::CommitRef {
                to,
                req_ptr,
                error_code,
            } => {
                fx.send(Outbound::Coordinator {
                    to,
                    signal: ParticipantSignal::CommitRef(CommitRef(NodeRef {
                        tc_connect_ptr: req_ptr,
                        sender_node_id: self.address.node(),
                        trans_id: record.trans_id,
                        error_code,
                    })),
                });
                FinishedOutcome::Aborted {
                    last_replica: record.last_replica,
                    commit_error: Some(error_code),
                }
            }
        };

        tracing::debug!(
            "[{}] Aborted operation {} of {}",
            self.name,
            record.tc_oprec,
            record.trans_id
        );
        self.set_state(handle, OperationState::Aborted);
        self.finish_record(handle, outcome);
        Ok(())
    }

    fn reply_aborted(
        &self,
        to: BlockRef,
        tc_oprec: u32,
        trans_id: TransactionId,
        last_lqh: bool,
        fx: &mut Effects,
    ) {
        fx.send(Outbound::Coordinator {
            to,
            signal: ParticipantSignal::Aborted(Aborted {
                sender_data: tc_oprec,
                trans_id,
                node_id: self.address.node(),
                last_lqh,
            }),
        });
    }

    // === PUSH ABORT ===

    fn on_router_signal(&mut self, signal: RouterSignal, fx: &mut Effects) -> KernelResult<()> {
        match signal {
            RouterSignal::SendPushAbortConf(conf) => self.on_push_abort_conf(conf, fx),
            RouterSignal::PushAbortTrainOrd(order) => {
                self.on_push_abort_train(order);
                Ok(())
            }
        }
    }

    fn on_push_abort_conf(&mut self, conf: SendPushAbortConf, fx: &mut Effects) -> KernelResult<()> {
        let key = OperationKey {
            origin_ref: conf.tc_blockref,
            tc_oprec: conf.tc_oprec,
        };
        let handle = self.by_key.get(&key).copied().ok_or(
            ProtocolViolation::UnknownOperation {
                token: conf.tc_oprec,
                trans_id: conf.trans_id,
            },
        )?;
        self.check_transaction(handle, conf.tc_oprec, conf.trans_id)?;

        let state = self.record(handle, conf.tc_oprec, conf.trans_id)?.state;
        if state != OperationState::Aborting {
            return Err(ProtocolViolation::InvalidTransition {
                signal: "SEND_PUSH_ABORT_CONF",
                trans_id: conf.trans_id,
                state: state.to_string(),
            });
        }
        self.finish_abort(handle, fx)
    }

    fn on_push_abort_train(&mut self, order: PushAbortTrainOrd) {
        let key = OperationKey {
            origin_ref: order.tc_blockref,
            tc_oprec: order.tc_oprec,
        };
        match self.held.remove(&key) {
            Some(held) => tracing::debug!(
                "[{}] Dropped reference to operation {} of {} owned by {}{}",
                self.name,
                order.tc_oprec,
                held.trans_id,
                held.owner,
                if order.index_query_thread {
                    " (query thread)"
                } else {
                    ""
                }
            ),
            None => tracing::debug!(
                "[{}] No reference held to operation {} of {}",
                self.name,
                order.tc_oprec,
                order.trans_id
            ),
        }
    }

    // === COMMIT-ACK MARKERS ===

    fn remove_marker(&mut self, trans_id: TransactionId, fail_api: bool) {
        match self.markers.remove(&trans_id) {
            Some(_) => tracing::debug!(
                "[{}] Removed commit-ack marker of {}{}",
                self.name,
                trans_id,
                if fail_api { " (API failed)" } else { "" }
            ),
            None => tracing::debug!("[{}] No commit-ack marker for {}", self.name, trans_id),
        }
    }

    fn drop_marker_operation(&mut self, trans_id: TransactionId) {
        if let Some(marker) = self.markers.get_mut(&trans_id) {
            marker.operations = marker.operations.saturating_sub(1);
            if marker.operations == 0 {
                self.markers.remove(&trans_id);
            }
        }
    }

    // === NODE FAILURE ===

    /// React to a failed node: repair broken abort chains and reclaim what a
    /// failed coordinator left behind
    pub fn on_node_failure(&mut self, node: NodeId) -> Vec<Outbound> {
        let mut rolled_back = 0;
        let mut completed = 0;
        let mut in_doubt = 0;

        for handle in self.records.handles() {
            let Ok(record) = self.records.get_mut(handle) else {
                continue;
            };
            if record.next_replica.is_some_and(|next| next.node() == node) {
                record.next_replica = None;
            }
            if record.tc_ref.node() != node {
                continue;
            }

            let (state, op, gci) = (record.state, record.store_op(), record.gci);
            let last_replica = record.last_replica;
            match state {
                OperationState::Idle => {
                    self.store.rollback(op);
                    record.state = OperationState::Aborted;
                    self.finish_record(
                        handle,
                        FinishedOutcome::Aborted {
                            last_replica,
                            commit_error: None,
                        },
                    );
                    rolled_back += 1;
                }
                OperationState::CompletePending => match self.store.complete(op) {
                    Ok(()) => {
                        record.state = OperationState::Completed;
                        self.finish_record(
                            handle,
                            FinishedOutcome::Completed {
                                gci: gci.unwrap_or(Gci::ZERO),
                            },
                        );
                        completed += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            "[{}] Store failed to complete operation {} of {} after coordinator failure: {}",
                            self.name,
                            op.tc_oprec,
                            op.trans_id,
                            e
                        );
                        // Left for the takeover coordinator's COMPLETE
                        record.state = OperationState::Committed;
                        record.in_doubt = true;
                        in_doubt += 1;
                    }
                },
                OperationState::Committed => {
                    record.in_doubt = true;
                    in_doubt += 1;
                }
                _ => {}
            }
        }

        for marker in self.markers.values_mut() {
            if marker.tc_ref.node() == node {
                marker.in_doubt = true;
            }
        }

        if rolled_back + completed + in_doubt > 0 {
            tracing::warn!(
                "[{}] Node {} failed: rolled back {}, completed {}, {} committed operations in doubt",
                self.name,
                node,
                rolled_back,
                completed,
                in_doubt
            );
        }
        Vec::new()
    }

    // === RECORD HELPERS ===

    fn record(
        &self,
        handle: Handle,
        token: u32,
        trans_id: TransactionId,
    ) -> KernelResult<&OperationRecord> {
        self.records
            .get(handle)
            .map_err(|_| ProtocolViolation::UnknownOperation { token, trans_id })
    }

    fn set_state(&mut self, handle: Handle, state: OperationState) {
        if let Ok(record) = self.records.get_mut(handle) {
            record.state = state;
        }
    }

    fn check_transaction(
        &self,
        handle: Handle,
        token: u32,
        trans_id: TransactionId,
    ) -> KernelResult<()> {
        let record = self.record(handle, token, trans_id)?;
        if record.trans_id != trans_id {
            return Err(ProtocolViolation::TransactionMismatch {
                token,
                expected: record.trans_id,
                actual: trans_id,
            });
        }
        Ok(())
    }

    /// A takeover coordinator now owns the operation
    fn rehome(&mut self, handle: Handle, new_ref: BlockRef) {
        let Ok(record) = self.records.get_mut(handle) else {
            return;
        };
        if record.tc_ref == new_ref {
            return;
        }
        tracing::info!(
            "[{}] Operation {} of {} handed over from {} to {}",
            self.name,
            record.tc_oprec,
            record.trans_id,
            record.tc_ref,
            new_ref
        );
        record.tc_ref = new_ref;
        record.in_doubt = false;
        if let Some(marker) = self.markers.get_mut(&record.trans_id) {
            marker.tc_ref = new_ref;
            marker.in_doubt = false;
        }
    }

    /// Release a record and remember how it ended
    fn finish_record(&mut self, handle: Handle, outcome: FinishedOutcome) {
        let Ok(record) = self.records.release(handle) else {
            return;
        };
        let key = record.key();
        self.by_key.remove(&key);
        self.history.push_back(FinishedOperation {
            key,
            trans_id: record.trans_id,
            lqh_word: handle.to_word(),
            tc_ref: record.tc_ref,
            outcome,
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Finished operation of `trans_id` under `key`. An entry left by an
    /// earlier transaction that used the same token does not match.
    fn finished_by_key(
        &self,
        key: OperationKey,
        trans_id: TransactionId,
    ) -> Option<FinishedOperation> {
        self.history
            .iter()
            .rev()
            .find(|f| f.key == key && f.trans_id == trans_id)
            .copied()
    }

    fn finished_by_word(
        &self,
        word: u32,
        trans_id: TransactionId,
    ) -> KernelResult<Option<FinishedOperation>> {
        Ok(self
            .history
            .iter()
            .rev()
            .find(|f| f.lqh_word == word && f.trans_id == trans_id)
            .copied())
    }
}
