//! Participant node runtime
//!
//! Runs one task per thread kernel plus the routing agent, each with its own
//! endpoint on the network. Kernels sit behind a mutex so the prepare path and
//! test inspection can reach them while the task owns the inbox.

use crate::config::ParticipantConfig;
use crate::error::{ParticipantError, Result};
use crate::kernel::{Outbound, ParticipantKernel};
use crate::operation::{OperationKey, PrepareRequest};
use crate::router::PushAbortRouter;
use crate::store::TupleStore;
use crate::{router_ref, thread_ref};
use kestrel_common::{BlockRef, NodeId, ThreadId};
use kestrel_engine::{EndpointSender, Inbound, Network};
use kestrel_signal::{ProtocolViolation, RouterRequest, RouterSignal};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type SharedKernel<S> = Arc<Mutex<ParticipantKernel<S>>>;

/// A participant node: its thread kernels and routing agent
pub struct ParticipantNode<S: TupleStore + 'static> {
    node: NodeId,
    config: ParticipantConfig,
    network: Arc<Network>,
    kernels: Vec<SharedKernel<S>>,
    senders: Vec<EndpointSender>,
    halted: Arc<Mutex<Option<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: TupleStore + Clone + 'static> ParticipantNode<S> {
    /// Register the node's endpoints and start its tasks.
    ///
    /// Every thread kernel gets its own clone of `store`.
    pub fn start(
        network: Arc<Network>,
        node: NodeId,
        config: ParticipantConfig,
        store: S,
    ) -> Result<Self> {
        let halted = Arc::new(Mutex::new(None));
        let router_addr = router_ref(node);
        let router_endpoint = network.register(router_addr)?;

        let mut kernels = Vec::new();
        let mut senders = Vec::new();
        let mut tasks = Vec::new();
        for thread in (0..config.total_threads()).map(ThreadId) {
            let address = thread_ref(node, thread);
            let endpoint = network.register(address)?;
            let kernel = Arc::new(Mutex::new(ParticipantKernel::new(
                address,
                thread,
                router_addr,
                store.clone(),
                &config,
            )));
            let (sender, inbox) = endpoint.split();
            tasks.push(spawn_thread(
                kernel.clone(),
                sender.clone(),
                inbox,
                halted.clone(),
            ));
            kernels.push(kernel);
            senders.push(sender);
        }

        let router = PushAbortRouter::new(
            node,
            config.receive_threads,
            config.query_threads,
            config.push_abort_timeout,
        );
        let (router_sender, router_inbox) = router_endpoint.split();
        tasks.push(spawn_router(
            router,
            router_sender,
            router_inbox,
            config.sweep_interval,
            halted.clone(),
        ));

        tracing::info!(
            "[node {}] Participant started with {} receive and {} query threads",
            node,
            config.receive_threads,
            config.query_threads
        );

        Ok(Self {
            node,
            config,
            network,
            kernels,
            senders,
            halted,
            tasks,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn thread_address(&self, thread: ThreadId) -> BlockRef {
        thread_ref(self.node, thread)
    }

    /// Prepare an operation on a receive thread and announce it to the
    /// coordinator. Sibling threads take a reference to it.
    pub fn prepare(&self, thread: ThreadId, request: &PrepareRequest) -> Result<u32> {
        if let Some(reason) = self.halt_reason() {
            return Err(ParticipantError::Halted(reason));
        }
        self.check_owner(thread)?;
        for (i, sibling) in request.siblings.iter().enumerate() {
            if sibling.0 >= self.config.total_threads() {
                return Err(ParticipantError::UnknownThread(*sibling));
            }
            if *sibling == thread {
                return Err(ParticipantError::OwnerAsSibling(thread));
            }
            if request.siblings[..i].contains(sibling) {
                return Err(ParticipantError::DuplicateSibling(*sibling));
            }
        }

        let (word, out) = self.kernels[thread.0 as usize].lock().prepare(request)?;
        let owner = self.thread_address(thread);
        let key = OperationKey {
            origin_ref: request.tc_ref,
            tc_oprec: request.tc_oprec,
        };
        for sibling in &request.siblings {
            self.kernels[sibling.0 as usize]
                .lock()
                .hold_reference(key, request.trans_id, owner);
        }

        let sender = &self.senders[thread.0 as usize];
        for outbound in out {
            send_outbound(sender, &outbound);
        }
        Ok(word)
    }

    fn check_owner(&self, thread: ThreadId) -> Result<()> {
        if thread.0 >= self.config.total_threads() {
            Err(ParticipantError::UnknownThread(thread))
        } else if thread.0 >= self.config.receive_threads {
            Err(ParticipantError::NotAnOwnerThread(thread))
        } else {
            Ok(())
        }
    }

    /// Run `f` against a thread kernel
    pub fn with_kernel<R>(
        &self,
        thread: ThreadId,
        f: impl FnOnce(&ParticipantKernel<S>) -> R,
    ) -> Option<R> {
        self.kernels
            .get(thread.0 as usize)
            .map(|kernel| f(&kernel.lock()))
    }

    /// Operation records seized across all threads
    pub fn active_operations(&self) -> usize {
        self.kernels.iter().map(|k| k.lock().active_operations()).sum()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    /// Stop every task and release the node's addresses
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for thread in (0..self.config.total_threads()).map(ThreadId) {
            self.network.deregister(thread_ref(self.node, thread));
        }
        self.network.deregister(router_ref(self.node));
        tracing::info!("[node {}] Participant shut down", self.node);
    }
}

fn send_outbound(sender: &EndpointSender, outbound: &Outbound) {
    let frame = match outbound.to_frame(sender.address()) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(
                "[lqh {}] Failed to encode signal for {}: {}",
                sender.address(),
                outbound.to(),
                e
            );
            return;
        }
    };
    if let Err(e) = sender.send(outbound.to(), frame) {
        tracing::warn!(
            "[lqh {}] Failed to send to {}: {}",
            sender.address(),
            outbound.to(),
            e
        );
    }
}

fn halt(halted: &Mutex<Option<String>>, address: BlockRef, violation: &ProtocolViolation) {
    tracing::error!("[lqh {}] Protocol violation, halting: {}", address, violation);
    halted.lock().get_or_insert_with(|| format!("{}: {}", address, violation));
}

fn spawn_thread<S: TupleStore + 'static>(
    kernel: SharedKernel<S>,
    sender: EndpointSender,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    halted: Arc<Mutex<Option<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = inbox.recv().await {
            let result = kernel.lock().on_inbound(&inbound);
            match result {
                Ok(out) => {
                    for outbound in &out {
                        send_outbound(&sender, outbound);
                    }
                }
                Err(violation) => {
                    halt(&halted, sender.address(), &violation);
                    break;
                }
            }
        }
    })
}

fn spawn_router(
    mut router: PushAbortRouter,
    sender: EndpointSender,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    sweep_interval: std::time::Duration,
    halted: Arc<Mutex<Option<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                inbound = inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    let Inbound::Signal(frame) = inbound else { continue };

                    let request = match RouterRequest::decode(&frame) {
                        Ok(RouterRequest::SendPushAbortReq(request)) => request,
                        Err(source) => {
                            let violation = ProtocolViolation::Malformed {
                                sender: frame.sender,
                                source,
                            };
                            halt(&halted, sender.address(), &violation);
                            break;
                        }
                    };

                    for (to, signal) in router.on_request(&request, Instant::now()) {
                        let delivered = sender.send(to, signal.to_frame(sender.address()));
                        if let Err(e) = &delivered {
                            tracing::warn!("[router {}] Failed to send to {}: {}", sender.address(), to, e);
                        }
                        if matches!(signal, RouterSignal::PushAbortTrainOrd(_)) {
                            router.record_delivery(
                                request.sender_ref,
                                request.send_thread_signal_id,
                                delivered.is_ok(),
                            );
                        }
                    }
                }
                _ = sweep.tick() => {
                    router.sweep_expired(Instant::now());
                }
            }
        }
    })
}
