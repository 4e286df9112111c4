//! Coordinator runtime
//!
//! A single task owns the endpoint inbox and feeds acknowledgements to the
//! kernel. Callers take decisions through the same kernel and wait for the
//! outcome on a oneshot channel resolved by whichever step finishes the
//! transaction.

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::kernel::{TcKernel, TcOutput};
use crate::transaction::{AbortReason, Phase, TransactionOutcome, TransactionPlan};
use kestrel_common::{BlockRef, SharedGciClock, TransactionId};
use kestrel_engine::{EndpointSender, Inbound, Network};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Waiters = Arc<Mutex<HashMap<TransactionId, Vec<oneshot::Sender<TransactionOutcome>>>>>;

/// Transaction coordinator attached to the network at one address
pub struct Coordinator {
    address: BlockRef,
    config: CoordinatorConfig,
    network: Arc<Network>,
    kernel: Arc<Mutex<TcKernel>>,
    waiters: Waiters,
    sender: EndpointSender,
    halted: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl Coordinator {
    /// Register `address` and start the inbox task
    pub fn start(
        network: Arc<Network>,
        address: BlockRef,
        config: CoordinatorConfig,
        clock: SharedGciClock,
    ) -> Result<Self> {
        let endpoint = network.register(address)?;
        let kernel = Arc::new(Mutex::new(TcKernel::new(
            address,
            clock,
            config.transaction_pool_capacity,
            config.use_packed_signals,
            config.finished_history,
        )));
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let halted = Arc::new(Mutex::new(None));

        let (sender, inbox) = endpoint.split();
        let task = spawn_inbox(
            kernel.clone(),
            sender.clone(),
            inbox,
            waiters.clone(),
            halted.clone(),
        );

        tracing::info!("[tc {}] Coordinator started", address);

        Ok(Self {
            address,
            config,
            network,
            kernel,
            waiters,
            sender,
            halted,
            task,
        })
    }

    pub fn address(&self) -> BlockRef {
        self.address
    }

    /// Seize a transaction record, retrying while the pool is full or a
    /// replica is unavailable
    pub async fn begin(&self, plan: &TransactionPlan) -> Result<()> {
        self.config
            .retry
            .run(|| std::future::ready(self.try_begin(plan)))
            .await
    }

    fn try_begin(&self, plan: &TransactionPlan) -> Result<()> {
        self.check_running()?;
        if let Some(node) = plan
            .operations
            .iter()
            .flat_map(|op| &op.chain)
            .map(|replica| replica.node())
            .find(|node| self.network.is_failed(*node))
        {
            return Err(CoordinatorError::ReplicaUnavailable(node));
        }
        self.kernel.lock().begin(plan)
    }

    /// Commit and wait for the outcome
    pub async fn commit(&self, trans_id: TransactionId) -> Result<TransactionOutcome> {
        self.decide(trans_id, |kernel| kernel.commit(trans_id)).await
    }

    /// Abort and wait for every replica to confirm
    pub async fn abort(&self, trans_id: TransactionId) -> Result<TransactionOutcome> {
        self.decide(trans_id, |kernel| {
            kernel.abort(trans_id, AbortReason::Requested)
        })
        .await
    }

    async fn decide(
        &self,
        trans_id: TransactionId,
        step: impl FnOnce(&mut TcKernel) -> Result<TcOutput>,
    ) -> Result<TransactionOutcome> {
        self.check_running()?;
        let (tx, rx) = oneshot::channel();
        let output = {
            let mut kernel = self.kernel.lock();
            let output = step(&mut kernel)?;
            // Registered before any request leaves, so no outcome is missed
            self.waiters.lock().entry(trans_id).or_default().push(tx);
            output
        };
        dispatch(&self.sender, &self.waiters, output);

        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Ok(TransactionOutcome::Unknown {
                reason: self
                    .halt_reason()
                    .unwrap_or_else(|| "coordinator stopped".to_string()),
            }),
            Err(_) => {
                tracing::warn!(
                    "[tc {}] No outcome for {} within {:?}",
                    self.address,
                    trans_id,
                    self.config.ack_timeout
                );
                Ok(TransactionOutcome::Unknown {
                    reason: format!("no outcome within {:?}", self.config.ack_timeout),
                })
            }
        }
    }

    /// Abort every transaction short of its commit point without waiting
    pub fn abort_all(&self) -> usize {
        let (count, output) = self.kernel.lock().abort_all();
        dispatch(&self.sender, &self.waiters, output);
        count
    }

    pub fn phase(&self, trans_id: TransactionId) -> Option<Phase> {
        self.kernel.lock().phase(trans_id)
    }

    pub fn active_transactions(&self) -> usize {
        self.kernel.lock().active_transactions()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    fn check_running(&self) -> Result<()> {
        match self.halt_reason() {
            Some(reason) => Err(CoordinatorError::Halted(reason)),
            None => Ok(()),
        }
    }

    /// Abort what has not reached its commit point, then stop the inbox task
    /// and release the address.
    ///
    /// Pending callers learn an unknown outcome.
    pub fn shutdown(self) {
        let aborted = self.abort_all();
        if aborted > 0 {
            tracing::warn!(
                "[tc {}] Shutting down with {} transactions aborted",
                self.address,
                aborted
            );
        }
        self.task.abort();
        self.waiters.lock().clear();
        self.network.deregister(self.address);
        tracing::info!("[tc {}] Coordinator shut down", self.address);
    }
}

fn dispatch(sender: &EndpointSender, waiters: &Waiters, output: TcOutput) {
    for outbound in &output.out {
        let frame = match outbound.to_frame(sender.address()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    "[tc {}] Failed to encode signal for {}: {}",
                    sender.address(),
                    outbound.to,
                    e
                );
                continue;
            }
        };
        // A failed node shows up as NodeFailed in the inbox
        if let Err(e) = sender.send(outbound.to, frame) {
            tracing::warn!(
                "[tc {}] Failed to send to {}: {}",
                sender.address(),
                outbound.to,
                e
            );
        }
    }

    for (trans_id, outcome) in output.finished {
        let Some(pending) = waiters.lock().remove(&trans_id) else {
            continue;
        };
        for waiter in pending {
            let _ = waiter.send(outcome.clone());
        }
    }
}

fn spawn_inbox(
    kernel: Arc<Mutex<TcKernel>>,
    sender: EndpointSender,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    waiters: Waiters,
    halted: Arc<Mutex<Option<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = inbox.recv().await {
            let result = kernel.lock().on_inbound(&inbound);
            match result {
                Ok(output) => dispatch(&sender, &waiters, output),
                Err(violation) => {
                    tracing::error!(
                        "[tc {}] Protocol violation, halting: {}",
                        sender.address(),
                        violation
                    );
                    let reason = format!("{}: {}", sender.address(), violation);
                    halted.lock().get_or_insert_with(|| reason.clone());
                    for (_, pending) in waiters.lock().drain() {
                        for waiter in pending {
                            let _ = waiter.send(TransactionOutcome::Unknown {
                                reason: reason.clone(),
                            });
                        }
                    }
                    break;
                }
            }
        }
    })
}
