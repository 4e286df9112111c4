//! End-to-end commit/abort runs between a coordinator and participant nodes
//! over the in-memory network

use kestrel_common::{BlockRef, Gci, GciClock, NodeId, ThreadId, TransactionId};
use kestrel_coordinator::{
    AbortReason, Coordinator, CoordinatorConfig, CoordinatorError, Phase, TransactionOutcome,
    TransactionPlan,
};
use kestrel_engine::Network;
use kestrel_participant::{
    MemoryStore, ParticipantConfig, ParticipantError, ParticipantNode, PrepareRequest,
    StoreError, StoreOp, thread_ref,
};
use kestrel_signal::{
    CommitReq, Completed, CoordinatorSignal, OperationAck, ParticipantSignal,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const TRANS: TransactionId = TransactionId::new(1, 42);

fn tc_address() -> BlockRef {
    BlockRef::new(NodeId(1), 0x2000)
}

fn lqh(node: u16) -> BlockRef {
    thread_ref(NodeId(node), ThreadId(0))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Cluster {
    network: Arc<Network>,
    coordinator: Arc<Coordinator>,
    nodes: HashMap<u16, ParticipantNode<MemoryStore>>,
    stores: HashMap<u16, MemoryStore>,
}

impl Cluster {
    fn start(nodes: &[u16]) -> Self {
        init_tracing();
        let network = Arc::new(Network::new());
        let coordinator = Coordinator::start(
            network.clone(),
            tc_address(),
            CoordinatorConfig::for_testing(),
            Arc::new(GciClock::starting_at(Gci::new(3, 0))),
        )
        .unwrap();

        let mut participants = HashMap::new();
        let mut stores = HashMap::new();
        for &node in nodes {
            let store = MemoryStore::new(format!("store-{}", node));
            let participant = ParticipantNode::start(
                network.clone(),
                NodeId(node),
                ParticipantConfig::for_testing(),
                store.clone(),
            )
            .unwrap();
            participants.insert(node, participant);
            stores.insert(node, store);
        }

        Self {
            network,
            coordinator: Arc::new(coordinator),
            nodes: participants,
            stores,
        }
    }

    /// Begin the transaction at the coordinator, then prepare every replica
    async fn prepare(&self, plan: &TransactionPlan, siblings: &[ThreadId]) {
        self.coordinator.begin(plan).await.unwrap();
        for op in &plan.operations {
            for replica in &op.chain {
                let request = PrepareRequest {
                    trans_id: plan.trans_id,
                    tc_oprec: op.tc_oprec,
                    tc_ref: tc_address(),
                    chain: op.chain.clone(),
                    siblings: siblings.to_vec(),
                };
                self.nodes[&replica.node().0]
                    .prepare(ThreadId(0), &request)
                    .unwrap();
            }
        }
    }

    fn store(&self, node: u16) -> &MemoryStore {
        &self.stores[&node]
    }

    fn assert_running(&self) {
        assert!(!self.coordinator.is_halted(), "{:?}", self.coordinator.halt_reason());
        for node in self.nodes.values() {
            assert!(!node.is_halted(), "{:?}", node.halt_reason());
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn op(tc_oprec: u32) -> StoreOp {
    StoreOp {
        trans_id: TRANS,
        tc_oprec,
    }
}

#[tokio::test]
async fn test_commit_on_two_replicas() {
    let cluster = Cluster::start(&[2, 3]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2), lqh(3)]);
    cluster.prepare(&plan, &[]).await;

    let outcome = cluster.coordinator.commit(TRANS).await.unwrap();
    assert_eq!(
        outcome,
        TransactionOutcome::Committed {
            gci: Gci::new(3, 0)
        }
    );

    for node in [2, 3] {
        assert_eq!(cluster.store(node).committed_gci(op(7)), Some(Gci::new(3, 0)));
        assert_eq!(cluster.store(node).commit_count(op(7)), 1);
        assert_eq!(cluster.store(node).complete_count(op(7)), 1);
    }
    assert_eq!(cluster.coordinator.active_transactions(), 0);

    // Markers go once every replica has completed
    for node in [2, 3] {
        let participant = &cluster.nodes[&node];
        eventually("commit-ack marker removal", || {
            participant
                .with_kernel(ThreadId(0), |k| k.marker(TRANS).is_none())
                .unwrap_or(false)
        })
        .await;
        assert_eq!(participant.active_operations(), 0);
    }
    cluster.assert_running();
}

#[tokio::test]
async fn test_commit_refused_by_one_replica_aborts_all() {
    let cluster = Cluster::start(&[2, 3]);
    cluster.store(3).fail_commits_of(TRANS, StoreError::NO_SPACE);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2), lqh(3)]);
    cluster.prepare(&plan, &[]).await;

    let outcome = cluster.coordinator.commit(TRANS).await.unwrap();
    assert_eq!(
        outcome,
        TransactionOutcome::Aborted {
            reason: AbortReason::CommitRefused {
                node: NodeId(3),
                error_code: StoreError::NO_SPACE,
            }
        }
    );

    // Replica 2 may have committed before the refusal; it must be undone
    eventually("rollback on replica 2", || {
        cluster.store(2).committed_gci(op(7)).is_none() && cluster.store(2).rollback_count(op(7)) > 0
    })
    .await;
    assert_eq!(cluster.store(3).committed_len(), 0);
    assert_eq!(cluster.store(2).complete_count(op(7)), 0);
    cluster.assert_running();
}

#[tokio::test]
async fn test_duplicate_deliveries_are_harmless() {
    let cluster = Cluster::start(&[2]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]);
    cluster.prepare(&plan, &[]).await;
    assert!(cluster.coordinator.commit(TRANS).await.unwrap().is_committed());

    // A repeated COMMIT_REQ is answered from the replica's history
    let commit_req = CoordinatorSignal::CommitReq(CommitReq {
        req_ptr: 7,
        req_blockref: tc_address(),
        gci: Gci::new(3, 0),
        trans_id: TRANS,
        old_blockref: tc_address(),
        tc_oprec: 7,
    });
    cluster
        .network
        .send(lqh(2), commit_req.to_frame(tc_address()).unwrap())
        .unwrap();

    // A repeated COMPLETED reaches a coordinator that already finished
    let completed = ParticipantSignal::Completed(Completed(OperationAck {
        tc_connect_ptr: 7,
        trans_id: TRANS,
    }));
    cluster
        .network
        .send(tc_address(), completed.to_frame(lqh(2)).unwrap())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.store(2).commit_count(op(7)), 1);
    cluster.assert_running();
}

#[tokio::test]
async fn test_reused_token_aborts_on_replica_that_never_prepared_it() {
    let cluster = Cluster::start(&[2, 3]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2), lqh(3)]);
    cluster.prepare(&plan, &[]).await;
    assert!(cluster.coordinator.commit(TRANS).await.unwrap().is_committed());

    // Token 7 is free again; only replica 2 prepares it this time
    let next = TransactionId::new(1, 43);
    let plan = TransactionPlan::new(next).operation(7, vec![lqh(2), lqh(3)]);
    cluster.coordinator.begin(&plan).await.unwrap();
    let request = PrepareRequest {
        trans_id: next,
        tc_oprec: 7,
        tc_ref: tc_address(),
        chain: vec![lqh(2), lqh(3)],
        siblings: vec![],
    };
    cluster.nodes[&2].prepare(ThreadId(0), &request).unwrap();

    let outcome = cluster.coordinator.abort(next).await.unwrap();
    assert_eq!(
        outcome,
        TransactionOutcome::Aborted {
            reason: AbortReason::Requested
        }
    );

    let reused = StoreOp {
        trans_id: next,
        tc_oprec: 7,
    };
    assert_eq!(cluster.store(2).rollback_count(reused), 1);
    // Let the forwarded abort reach replica 3 as well
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cluster.store(3).rollback_count(reused), 0);
    assert_eq!(cluster.store(3).committed_gci(op(7)), Some(Gci::new(3, 0)));
    cluster.assert_running();
}

#[tokio::test]
async fn test_prepare_rejects_bad_sibling_lists() {
    let cluster = Cluster::start(&[2]);
    let mut request = PrepareRequest {
        trans_id: TRANS,
        tc_oprec: 7,
        tc_ref: tc_address(),
        chain: vec![lqh(2)],
        siblings: vec![ThreadId(1), ThreadId(1)],
    };
    assert_eq!(
        cluster.nodes[&2].prepare(ThreadId(0), &request),
        Err(ParticipantError::DuplicateSibling(ThreadId(1)))
    );

    request.siblings = vec![ThreadId(2), ThreadId(0)];
    assert_eq!(
        cluster.nodes[&2].prepare(ThreadId(0), &request),
        Err(ParticipantError::OwnerAsSibling(ThreadId(0)))
    );

    // Nothing was seized or held by the rejected attempts
    assert_eq!(cluster.nodes[&2].active_operations(), 0);
    for thread in [ThreadId(1), ThreadId(2)] {
        let held = cluster.nodes[&2].with_kernel(thread, |k| k.held_references());
        assert_eq!(held, Some(0));
    }

    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]);
    cluster.coordinator.begin(&plan).await.unwrap();
    request.siblings = vec![ThreadId(1), ThreadId(2)];
    assert!(cluster.nodes[&2].prepare(ThreadId(0), &request).is_ok());
    cluster.assert_running();
}

#[tokio::test]
async fn test_complete_waits_for_every_commit_ack() {
    let cluster = Cluster::start(&[2, 3]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2), lqh(3)]);
    cluster.prepare(&plan, &[]).await;

    cluster.network.hold(lqh(3));
    let coordinator = cluster.coordinator.clone();
    let commit = tokio::spawn(async move { coordinator.commit(TRANS).await });

    eventually("commit on replica 2", || {
        cluster.store(2).commit_count(op(7)) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        cluster.coordinator.phase(TRANS),
        Some(Phase::CollectingCommitAcks)
    );
    assert_eq!(cluster.store(2).complete_count(op(7)), 0);

    cluster.network.release(lqh(3)).unwrap();
    let outcome = commit.await.unwrap().unwrap();
    assert!(outcome.is_committed());
    assert_eq!(cluster.store(2).complete_count(op(7)), 1);
    assert_eq!(cluster.store(3).complete_count(op(7)), 1);
    cluster.assert_running();
}

#[tokio::test]
async fn test_abort_pushes_to_sibling_threads() {
    let cluster = Cluster::start(&[2]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]);
    let siblings = [ThreadId(1), ThreadId(2)];
    cluster.prepare(&plan, &siblings).await;

    let participant = &cluster.nodes[&2];
    for thread in siblings {
        assert_eq!(
            participant.with_kernel(thread, |k| k.held_references()),
            Some(1)
        );
    }

    let outcome = cluster.coordinator.abort(TRANS).await.unwrap();
    assert_eq!(
        outcome,
        TransactionOutcome::Aborted {
            reason: AbortReason::Requested
        }
    );
    assert_eq!(cluster.store(2).rollback_count(op(7)), 1);

    for thread in siblings {
        eventually("train order on sibling thread", || {
            participant.with_kernel(thread, |k| k.held_references()) == Some(0)
        })
        .await;
    }
    assert_eq!(participant.active_operations(), 0);
    cluster.assert_running();
}

#[tokio::test]
async fn test_failed_replica_is_excluded_from_the_phase() {
    let cluster = Cluster::start(&[2, 3]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2), lqh(3)]);
    cluster.prepare(&plan, &[]).await;

    cluster.network.hold(lqh(3));
    let coordinator = cluster.coordinator.clone();
    let commit = tokio::spawn(async move { coordinator.commit(TRANS).await });
    eventually("commit on replica 2", || {
        cluster.store(2).commit_count(op(7)) == 1
    })
    .await;

    cluster.network.fail_node(NodeId(3));
    let outcome = commit.await.unwrap().unwrap();
    assert!(outcome.is_committed());
    assert_eq!(cluster.store(2).complete_count(op(7)), 1);
    assert_eq!(cluster.store(3).commit_count(op(7)), 0);
    assert!(!cluster.coordinator.is_halted());
}

#[tokio::test]
async fn test_losing_every_replica_of_an_operation_aborts() {
    let cluster = Cluster::start(&[2, 3]);
    let plan = TransactionPlan::new(TRANS)
        .operation(7, vec![lqh(2)])
        .operation(8, vec![lqh(3)]);
    cluster.prepare(&plan, &[]).await;

    cluster.network.hold(lqh(3));
    let coordinator = cluster.coordinator.clone();
    let commit = tokio::spawn(async move { coordinator.commit(TRANS).await });
    eventually("commit on replica 2", || {
        cluster.store(2).commit_count(op(7)) == 1
    })
    .await;

    cluster.network.fail_node(NodeId(3));
    let outcome = commit.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        TransactionOutcome::Aborted {
            reason: AbortReason::ReplicasLost { tc_oprec: 8 }
        }
    );
    assert_eq!(cluster.store(2).committed_gci(op(7)), None);
}

#[tokio::test]
async fn test_abort_all_in_flight() {
    let cluster = Cluster::start(&[2]);
    for (id, tc_oprec) in [(42, 7), (43, 8)] {
        let plan =
            TransactionPlan::new(TransactionId::new(1, id)).operation(tc_oprec, vec![lqh(2)]);
        cluster.prepare(&plan, &[]).await;
    }

    assert_eq!(cluster.coordinator.abort_all(), 2);
    eventually("both transactions aborted", || {
        cluster.coordinator.active_transactions() == 0
    })
    .await;
    assert_eq!(cluster.nodes[&2].active_operations(), 0);
    cluster.assert_running();
}

#[tokio::test]
async fn test_begin_retries_then_gives_up_on_failed_replica() {
    let cluster = Cluster::start(&[2, 3]);
    cluster.network.fail_node(NodeId(3));

    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2), lqh(3)]);
    let result = cluster.coordinator.begin(&plan).await;
    match result {
        Err(CoordinatorError::Exhausted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert_eq!(*last, CoordinatorError::ReplicaUnavailable(NodeId(3)));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(cluster.coordinator.active_transactions(), 0);
}

#[tokio::test]
async fn test_participant_rolls_back_when_coordinator_fails() {
    let cluster = Cluster::start(&[2]);
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]);
    cluster.prepare(&plan, &[]).await;

    cluster.network.fail_node(NodeId(1));
    let participant = &cluster.nodes[&2];
    eventually("rollback after coordinator failure", || {
        participant.active_operations() == 0
    })
    .await;
    assert_eq!(cluster.store(2).rollback_count(op(7)), 1);
}

#[tokio::test]
async fn test_unaccountable_ack_halts_coordinator() {
    let cluster = Cluster::start(&[2]);
    let stranger = ParticipantSignal::Completed(Completed(OperationAck {
        tc_connect_ptr: 9,
        trans_id: TransactionId::new(7, 7),
    }));
    cluster
        .network
        .send(tc_address(), stranger.to_frame(lqh(2)).unwrap())
        .unwrap();

    eventually("coordinator halt", || cluster.coordinator.is_halted()).await;
    let plan = TransactionPlan::new(TRANS).operation(7, vec![lqh(2)]);
    assert!(matches!(
        cluster.coordinator.begin(&plan).await,
        Err(CoordinatorError::Halted(_))
    ));
}
