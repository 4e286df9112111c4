//! Push-abort routing agent
//!
//! When an operation owned by one receive thread is referenced from sibling
//! threads, the owner cannot roll back until the siblings have been told. The
//! owner hands the list of threads to the node's routing agent, which confirms
//! the request straight away and sends every listed thread a train order.
//! Delivery to the siblings is best effort; node-failure cleanup releases what
//! an undelivered order leaves behind.

use crate::thread_ref;
use kestrel_common::{BlockRef, NodeId, ThreadId};
use kestrel_signal::{PushAbortTrainOrd, RouterSignal, SendPushAbortConf, SendPushAbortReq};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Train orders for every thread listed in `request`, in list order
pub fn fan_out(
    request: &SendPushAbortReq,
    node: NodeId,
    query_threads: &HashSet<ThreadId>,
) -> Vec<(BlockRef, PushAbortTrainOrd)> {
    request
        .thread_ids
        .iter()
        .map(|&thread| {
            (
                thread_ref(node, thread),
                PushAbortTrainOrd {
                    tc_oprec: request.tc_oprec,
                    tc_blockref: request.tc_blockref,
                    trans_id: request.trans_id,
                    thread_id: thread,
                    send_thread_signal_id: request.send_thread_signal_id,
                    index_query_thread: query_threads.contains(&thread),
                    abort_ref: request.sender_ref,
                },
            )
        })
        .collect()
}

/// Accounting for one fan-out
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub requested: usize,
    pub delivered: usize,
    pub unreachable: usize,
    pub created: Instant,
}

impl DeliveryRecord {
    pub fn is_accounted(&self) -> bool {
        self.delivered + self.unreachable >= self.requested
    }
}

/// Identity of a fan-out request: requesting thread plus its signal id
type RequestKey = (BlockRef, u32);

/// Routing agent of one participant node
pub struct PushAbortRouter {
    node: NodeId,
    threads: u32,
    query_threads: HashSet<ThreadId>,
    timeout: Duration,
    records: HashMap<RequestKey, DeliveryRecord>,
}

impl PushAbortRouter {
    pub fn new(node: NodeId, receive_threads: u32, query_threads: u32, timeout: Duration) -> Self {
        Self {
            node,
            threads: receive_threads + query_threads,
            query_threads: (receive_threads..receive_threads + query_threads)
                .map(ThreadId)
                .collect(),
            timeout,
            records: HashMap::new(),
        }
    }

    /// Handle a fan-out request.
    ///
    /// Returns the confirmation for the requesting thread first, then one
    /// train order per listed thread. A repeated request is confirmed again
    /// without a second fan-out.
    pub fn on_request(
        &mut self,
        request: &SendPushAbortReq,
        now: Instant,
    ) -> Vec<(BlockRef, RouterSignal)> {
        let conf = RouterSignal::SendPushAbortConf(SendPushAbortConf {
            tc_oprec: request.tc_oprec,
            tc_blockref: request.tc_blockref,
            trans_id: request.trans_id,
            thread_id: request.thread_id,
            send_thread_signal_id: request.send_thread_signal_id,
        });
        let mut out = vec![(request.sender_ref, conf)];

        let key = (request.sender_ref, request.send_thread_signal_id);
        if self.records.contains_key(&key) {
            tracing::debug!(
                "[router {}] Repeated push-abort request {} from {}",
                self.node,
                request.send_thread_signal_id,
                request.sender_ref
            );
            return out;
        }

        let mut unreachable = 0;
        for (to, order) in fan_out(request, self.node, &self.query_threads) {
            if order.thread_id.0 >= self.threads {
                tracing::warn!(
                    "[router {}] Push-abort of {} names unknown thread {}",
                    self.node,
                    request.trans_id,
                    order.thread_id
                );
                unreachable += 1;
                continue;
            }
            out.push((to, RouterSignal::PushAbortTrainOrd(order)));
        }

        tracing::debug!(
            "[router {}] Fanning out abort of operation {} of {} to {} threads",
            self.node,
            request.tc_oprec,
            request.trans_id,
            out.len() - 1
        );
        self.records.insert(
            key,
            DeliveryRecord {
                requested: request.thread_ids.len(),
                delivered: 0,
                unreachable,
                created: now,
            },
        );
        out
    }

    /// Account for one train order handed to the transport
    pub fn record_delivery(&mut self, sender_ref: BlockRef, signal_id: u32, delivered: bool) {
        if let Some(record) = self.records.get_mut(&(sender_ref, signal_id)) {
            if delivered {
                record.delivered += 1;
            } else {
                record.unreachable += 1;
            }
        }
    }

    pub fn delivery(&self, sender_ref: BlockRef, signal_id: u32) -> Option<&DeliveryRecord> {
        self.records.get(&(sender_ref, signal_id))
    }

    /// Forget fan-outs older than the timeout; returns how many were dropped
    /// with deliveries still unaccounted
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut incomplete = 0;
        self.records.retain(|(sender, signal_id), record| {
            if now.duration_since(record.created) < timeout {
                return true;
            }
            if !record.is_accounted() || record.unreachable > 0 {
                incomplete += 1;
                tracing::warn!(
                    "[router] Push-abort {} from {} expired: {} of {} train orders delivered",
                    signal_id,
                    sender,
                    record.delivered,
                    record.requested
                );
            }
            false
        });
        incomplete
    }

    pub fn pending(&self) -> usize {
        self.records.len()
    }
}
