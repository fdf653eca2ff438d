//! Query dispatcher: send request batches to peers and collect responses.
//!
//! Each request goes to one peer; a response is matched by a caller-supplied
//! predicate. A request with no matching answer within the per-request
//! timeout is resent to the next peer, up to the retry budget. Callers cancel
//! through a [`Signal`]; cancellation abandons outstanding requests without
//! error. The dispatcher imposes no overall deadline of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfnode_messages::Message;
use cfnode_network::{signal_pair, PeerId, Signal};
use cfnode_types::{Clock, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::metrics::NodeMetrics;
use crate::registry::RegistryHandle;
use crate::session::PeerSession;
use crate::NodeError;

const MAX_TICK: Duration = Duration::from_millis(100);

/// Snapshot of one in-flight request.
#[derive(Clone, Debug, Serialize)]
pub struct QueryDescriptor {
    pub req_num: u64,
    pub peer: PeerId,
    pub peer_addr: String,
    pub command: &'static str,
    pub attempts: u8,
    pub created_at: Timestamp,
    pub last_request_at: Timestamp,
    pub last_response_at: Option<Timestamp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSelection {
    /// Every handshaken peer.
    All,
    /// The `n` peers reporting the greatest height.
    Best(usize),
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Wait for an answer before resending to the next peer.
    pub timeout: Duration,
    /// Resends allowed per request.
    pub retries: u8,
    pub selection: PeerSelection,
    /// Capacity of the response queue subscribed on each peer.
    pub queue_capacity: usize,
}

/// Outcome of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub resolved: usize,
    /// Requests that exhausted their retries.
    pub failed: usize,
    /// Requests outstanding when the caller cancelled.
    pub abandoned: usize,
}

struct Outstanding {
    request: Message,
    peer_idx: usize,
    sent_at: Instant,
    attempts: u8,
}

pub struct QueryDispatcher {
    registry: RegistryHandle,
    clock: Arc<dyn Clock>,
    metrics: Arc<NodeMetrics>,
    shutdown: Signal,
    next_req: AtomicU64,
    active: Mutex<HashMap<u64, QueryDescriptor>>,
}

impl QueryDispatcher {
    pub fn new(
        registry: RegistryHandle,
        clock: Arc<dyn Clock>,
        metrics: Arc<NodeMetrics>,
        shutdown: Signal,
    ) -> Self {
        Self {
            registry,
            clock,
            metrics,
            shutdown,
            next_req: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Requests currently awaiting an answer.
    pub fn active_queries(&self) -> Vec<QueryDescriptor> {
        let mut queries: Vec<_> = self.active.lock().values().cloned().collect();
        queries.sort_by_key(|q| q.req_num);
        queries
    }

    /// Dispatch `requests` across the selected peers.
    ///
    /// `check(peer, request, response)` returns `true` when `response`
    /// answers `request`; it sees every message the peers send while the
    /// batch is in flight.
    pub async fn query_batch<F>(
        &self,
        requests: Vec<Message>,
        check: F,
        cancel: Signal,
        options: QueryOptions,
    ) -> Result<BatchReport, NodeError>
    where
        F: Fn(&PeerSession, &Message, &Message) -> bool + Send + Sync,
    {
        let peers = select_peers(self.registry.peers().await?, options.selection);
        if peers.is_empty() {
            return Err(NodeError::NoPeers);
        }

        let (queue, mut responses) = mpsc::channel(options.queue_capacity.max(1));
        let (quit, quit_signal) = signal_pair();
        let subscriptions: Vec<u64> = peers
            .iter()
            .map(|peer| peer.subscribe(queue.clone(), quit_signal.clone()))
            .collect();
        drop(queue);

        let mut outstanding: HashMap<u64, Outstanding> = HashMap::new();
        for (i, request) in requests.into_iter().enumerate() {
            let req_num = self.next_req.fetch_add(1, Ordering::Relaxed);
            let peer_idx = i % peers.len();
            self.send(req_num, &peers[peer_idx], &request, 1);
            outstanding.insert(
                req_num,
                Outstanding {
                    request,
                    peer_idx,
                    sent_at: Instant::now(),
                    attempts: 1,
                },
            );
        }
        self.metrics.active_queries.set(self.active.lock().len() as i64);

        let tick = (options.timeout / 4).clamp(Duration::from_millis(1), MAX_TICK);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut report = BatchReport::default();

        while !outstanding.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.fired() => {
                    report.abandoned = outstanding.len();
                    break;
                }
                _ = self.shutdown.fired() => {
                    report.abandoned = outstanding.len();
                    break;
                }
                item = responses.recv() => {
                    let Some(item) = item else {
                        report.failed += outstanding.len();
                        break;
                    };
                    let now = self.clock.now();
                    let answered: Vec<u64> = outstanding
                        .iter()
                        .filter(|(_, o)| peers[o.peer_idx].id() == item.peer)
                        .filter(|(_, o)| check(&peers[o.peer_idx], &o.request, &item.message))
                        .map(|(req_num, _)| *req_num)
                        .collect();
                    let mut active = self.active.lock();
                    for req_num in &answered {
                        outstanding.remove(req_num);
                        active.remove(req_num);
                        report.resolved += 1;
                    }
                    for query in active.values_mut().filter(|q| q.peer == item.peer) {
                        query.last_response_at = Some(now);
                    }
                }
                _ = ticker.tick() => {
                    let expired: Vec<u64> = outstanding
                        .iter()
                        .filter(|(_, o)| o.sent_at.elapsed() >= options.timeout)
                        .map(|(req_num, _)| *req_num)
                        .collect();
                    for req_num in expired {
                        let Some(entry) = outstanding.get_mut(&req_num) else {
                            continue;
                        };
                        if entry.attempts > options.retries {
                            tracing::debug!(req = req_num, command = entry.request.command(), "query exhausted retries");
                            outstanding.remove(&req_num);
                            self.active.lock().remove(&req_num);
                            report.failed += 1;
                            continue;
                        }
                        entry.peer_idx = (entry.peer_idx + 1) % peers.len();
                        entry.attempts += 1;
                        entry.sent_at = Instant::now();
                        self.send(req_num, &peers[entry.peer_idx], &entry.request, entry.attempts);
                    }
                }
            }
            self.metrics.active_queries.set(self.active.lock().len() as i64);
        }

        {
            let mut active = self.active.lock();
            for req_num in outstanding.keys() {
                active.remove(req_num);
            }
            self.metrics.active_queries.set(active.len() as i64);
        }
        quit.fire();
        for (peer, id) in peers.iter().zip(subscriptions) {
            peer.unsubscribe(id);
        }
        Ok(report)
    }

    fn send(&self, req_num: u64, peer: &PeerSession, request: &Message, attempts: u8) {
        let now = self.clock.now();
        if let Err(e) = peer.queue_message(request.clone()) {
            tracing::debug!(req = req_num, peer = %peer.id(), error = %e, "query send failed");
        }
        let mut active = self.active.lock();
        let created_at = active.get(&req_num).map_or(now, |q| q.created_at);
        active.insert(
            req_num,
            QueryDescriptor {
                req_num,
                peer: peer.id(),
                peer_addr: peer.addr().to_string(),
                command: request.command(),
                attempts,
                created_at,
                last_request_at: now,
                last_response_at: None,
            },
        );
    }
}

/// Handshaken peers ordered by reported height, best first.
fn select_peers(mut peers: Vec<Arc<PeerSession>>, selection: PeerSelection) -> Vec<Arc<PeerSession>> {
    peers.retain(|p| p.is_connected() && p.verack_received());
    peers.sort_by(|a, b| {
        b.last_block_height()
            .cmp(&a.last_block_height())
            .then(a.id().cmp(&b.id()))
    });
    if let PeerSelection::Best(n) = selection {
        peers.truncate(n.max(1));
    }
    peers
}
