//! Connection supervisor: keeps outbound connections at the configured target.
//!
//! Opportunistic requests ask a [`CandidateSource`] for an address, dial it,
//! and on failure wait one retry interval before asking for a fresh
//! candidate. Permanent requests (persistent peers) redial the same address
//! after every failure or disconnect until removed or shut down.
//! Established links are handed to the chain service over a channel.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfnode_network::{Dialer, PeerLink, Signal};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::shutdown::TaskTracker;
use crate::NodeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnReqId(u64);

impl ConnReqId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// One outbound connection request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnReq {
    pub id: ConnReqId,
    pub addr: SocketAddr,
    pub permanent: bool,
    pub retry_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Pending,
    Connected,
    Failed,
}

/// Supplies addresses for opportunistic connections.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn next_candidate(&self) -> Result<SocketAddr, NodeError>;
}

/// A connection the supervisor established.
pub struct Connected {
    pub req: ConnReq,
    pub link: PeerLink,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub target_outbound: usize,
    pub retry_interval: Duration,
}

struct Tracked {
    req: ConnReq,
    state: ConnState,
}

struct Inner {
    config: SupervisorConfig,
    dialer: Arc<dyn Dialer>,
    candidates: Option<Arc<dyn CandidateSource>>,
    connected: mpsc::Sender<Connected>,
    requests: Mutex<HashMap<ConnReqId, Tracked>>,
    next_id: AtomicU64,
    shutdown: Signal,
    tasks: Arc<TaskTracker>,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// `candidates` of `None` disables opportunistic dialing.
    pub fn new(
        config: SupervisorConfig,
        dialer: Arc<dyn Dialer>,
        candidates: Option<Arc<dyn CandidateSource>>,
        connected: mpsc::Sender<Connected>,
        shutdown: Signal,
        tasks: Arc<TaskTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                candidates,
                connected,
                requests: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown,
                tasks,
            }),
        }
    }

    /// Open the initial opportunistic requests.
    pub fn start(&self) {
        if self.inner.candidates.is_none() {
            tracing::debug!("opportunistic dialing disabled");
            return;
        }
        for _ in 0..self.inner.config.target_outbound {
            self.new_conn_req();
        }
    }

    /// Ask for a fresh candidate and dial it.
    pub fn new_conn_req(&self) {
        if self.inner.shutdown.is_fired() || self.inner.candidates.is_none() {
            return;
        }
        let sup = self.clone();
        self.inner.tasks.spawn(async move { sup.find_and_dial().await });
    }

    /// Dial a specific address. Permanent requests redial forever.
    pub fn connect(&self, addr: SocketAddr, permanent: bool) -> ConnReqId {
        let req = self.register(addr, permanent);
        let id = req.id;
        if !self.inner.shutdown.is_fired() {
            let sup = self.clone();
            self.inner.tasks.spawn(async move { sup.dial_loop(req).await });
        }
        id
    }

    /// A connection went away. Permanent requests schedule a redial after
    /// the retry interval; others are forgotten.
    pub fn disconnect(&self, id: ConnReqId) {
        let retry = {
            let mut requests = self.inner.requests.lock();
            match requests.get_mut(&id) {
                Some(tracked) if tracked.req.permanent => {
                    tracked.req.retry_count += 1;
                    tracked.state = ConnState::Pending;
                    Some(tracked.req.clone())
                }
                Some(_) => {
                    requests.remove(&id);
                    None
                }
                None => None,
            }
        };
        let Some(req) = retry else {
            return;
        };
        if self.inner.shutdown.is_fired() {
            return;
        }
        tracing::debug!(req = %req.id, addr = %req.addr, retry = req.retry_count, "scheduling reconnect");
        let sup = self.clone();
        self.inner.tasks.spawn(async move {
            if sup.pause(sup.inner.config.retry_interval).await {
                sup.dial_loop(req).await;
            }
        });
    }

    /// Forget a request. Returns whether it existed.
    pub fn remove(&self, id: ConnReqId) -> bool {
        self.inner.requests.lock().remove(&id).is_some()
    }

    /// Settle the request behind a departed connection: redial a permanent
    /// peer, otherwise replace it with a fresh candidate.
    pub fn release(&self, req: &ConnReq) {
        if req.permanent {
            self.disconnect(req.id);
        } else {
            self.remove(req.id);
            self.new_conn_req();
        }
    }

    pub fn request(&self, id: ConnReqId) -> Option<ConnReq> {
        self.inner.requests.lock().get(&id).map(|t| t.req.clone())
    }

    pub fn state(&self, id: ConnReqId) -> Option<ConnState> {
        self.inner.requests.lock().get(&id).map(|t| t.state)
    }

    /// Requests currently tracked.
    pub fn len(&self) -> usize {
        self.inner.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, addr: SocketAddr, permanent: bool) -> ConnReq {
        let req = ConnReq {
            id: ConnReqId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            addr,
            permanent,
            retry_count: 0,
        };
        self.inner.requests.lock().insert(
            req.id,
            Tracked {
                req: req.clone(),
                state: ConnState::Pending,
            },
        );
        req
    }

    /// Sleep unless shutdown fires first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.inner.shutdown.fired() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn find_and_dial(self) {
        let Some(candidates) = self.inner.candidates.clone() else {
            return;
        };
        loop {
            if self.inner.shutdown.is_fired() {
                return;
            }
            let next = tokio::select! {
                biased;
                _ = self.inner.shutdown.fired() => return,
                next = candidates.next_candidate() => next,
            };
            match next {
                Ok(addr) => {
                    let req = self.register(addr, false);
                    self.dial_loop(req).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "no connection candidate, retrying");
                    if !self.pause(self.inner.config.retry_interval).await {
                        return;
                    }
                }
            }
        }
    }

    async fn dial_loop(self, mut req: ConnReq) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.inner.shutdown.fired() => return,
                result = self.inner.dialer.dial(req.addr) => result,
            };
            match result {
                Ok(link) => {
                    self.on_established(req, link).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(req = %req.id, addr = %req.addr, error = %e, "connection attempt failed");
                    if !req.permanent {
                        self.remove(req.id);
                        if self.pause(self.inner.config.retry_interval).await {
                            self.new_conn_req();
                        }
                        return;
                    }
                    match self.mark_failed(req.id) {
                        Some(next) => req = next,
                        None => return,
                    }
                    if !self.pause(self.inner.config.retry_interval).await {
                        return;
                    }
                }
            }
        }
    }

    fn mark_failed(&self, id: ConnReqId) -> Option<ConnReq> {
        let mut requests = self.inner.requests.lock();
        let tracked = requests.get_mut(&id)?;
        tracked.req.retry_count += 1;
        tracked.state = ConnState::Failed;
        Some(tracked.req.clone())
    }

    async fn on_established(&self, req: ConnReq, link: PeerLink) {
        let current = {
            let mut requests = self.inner.requests.lock();
            match requests.get_mut(&req.id) {
                Some(tracked) => {
                    tracked.state = ConnState::Connected;
                    tracked.req.clone()
                }
                None => {
                    tracing::debug!(req = %req.id, "request removed while dialing");
                    link.driver.disconnect();
                    return;
                }
            }
        };
        tracing::debug!(req = %current.id, addr = %current.addr, "connection established");
        let delivered = tokio::select! {
            biased;
            _ = self.inner.shutdown.fired() => false,
            sent = self.inner.connected.send(Connected { req: current, link }) => sent.is_ok(),
        };
        if !delivered {
            tracing::debug!(req = %req.id, "connection handler gone, dropping link");
        }
    }
}
