//! Peer registry: the single writer of live peer state.
//!
//! Sessions submit themselves on handshake and removal; everything else asks
//! questions through the same queue. Only the registry task touches
//! [`PeerState`], so registration, removal and the diversity counters never
//! race.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use cfnode_network::{PeerId, Signal};
use cfnode_types::BlockHash;
use tokio::sync::{mpsc, oneshot};

use crate::context::ServiceContext;
use crate::session::PeerSession;
use crate::supervisor::ConnectionSupervisor;
use crate::NodeError;

/// Registry queue depth.
pub const REGISTRY_QUEUE_CAPACITY: usize = 256;

pub enum RegistryCommand {
    AddPeer(Arc<PeerSession>),
    DonePeer(Arc<PeerSession>),
    UpdatePeerHeights {
        hash: BlockHash,
        height: i32,
        origin: Option<PeerId>,
    },
    Query(RegistryQuery),
}

pub enum RegistryQuery {
    ConnectedCount(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<Arc<PeerSession>>>),
    PeerByAddr {
        addr: SocketAddr,
        reply: oneshot::Sender<Option<Arc<PeerSession>>>,
    },
    OutboundGroups(oneshot::Sender<HashMap<String, usize>>),
    Snapshot(oneshot::Sender<RegistrySnapshot>),
}

/// Point-in-time copy of the registry's sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub outbound: Vec<PeerId>,
    pub persistent: Vec<PeerId>,
    pub outbound_groups: HashMap<String, usize>,
}

impl RegistrySnapshot {
    pub fn count(&self) -> usize {
        self.outbound.len() + self.persistent.len()
    }
}

pub struct PeerEntry {
    session: Weak<PeerSession>,
    /// Diversity group counted for this peer, if it is outbound.
    group: Option<String>,
}

impl PeerEntry {
    pub fn new(session: Weak<PeerSession>, group: Option<String>) -> Self {
        Self { session, group }
    }
}

/// Live peers, split into outbound and persistent sets.
///
/// A peer is in at most one set, and `outbound_groups` counts exactly the
/// groups recorded on the entries.
#[derive(Default)]
pub struct PeerState {
    outbound: HashMap<PeerId, PeerEntry>,
    persistent: HashMap<PeerId, PeerEntry>,
    outbound_groups: HashMap<String, usize>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.outbound.len() + self.persistent.len()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.outbound.contains_key(&id) || self.persistent.contains_key(&id)
    }

    /// Insert a peer. Returns `false` if it was already present.
    pub fn insert(&mut self, id: PeerId, persistent: bool, entry: PeerEntry) -> bool {
        if self.contains(id) {
            return false;
        }
        if let Some(group) = &entry.group {
            *self.outbound_groups.entry(group.clone()).or_default() += 1;
        }
        if persistent {
            self.persistent.insert(id, entry);
        } else {
            self.outbound.insert(id, entry);
        }
        true
    }

    /// Remove a peer from whichever set holds it.
    pub fn remove(&mut self, id: PeerId) -> Option<PeerEntry> {
        let entry = self
            .outbound
            .remove(&id)
            .or_else(|| self.persistent.remove(&id))?;
        if let Some(group) = &entry.group {
            if let Some(count) = self.outbound_groups.get_mut(group) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.outbound_groups.remove(group);
                }
            }
        }
        Some(entry)
    }

    /// Live sessions in both sets.
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.outbound
            .values()
            .chain(self.persistent.values())
            .filter_map(|entry| entry.session.upgrade())
            .collect()
    }

    pub fn outbound_groups(&self) -> &HashMap<String, usize> {
        &self.outbound_groups
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut outbound: Vec<PeerId> = self.outbound.keys().copied().collect();
        let mut persistent: Vec<PeerId> = self.persistent.keys().copied().collect();
        outbound.sort();
        persistent.sort();
        RegistrySnapshot {
            outbound,
            persistent,
            outbound_groups: self.outbound_groups.clone(),
        }
    }
}

/// Cheap, cloneable submission side of the registry queue.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
    shutdown: Signal,
}

impl RegistryHandle {
    pub fn channel(capacity: usize, shutdown: Signal) -> (Self, mpsc::Receiver<RegistryCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, shutdown }, rx)
    }

    async fn submit(&self, cmd: RegistryCommand) -> Result<(), NodeError> {
        if self.shutdown.is_fired() {
            return Err(NodeError::ShuttingDown);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.fired() => Err(NodeError::ShuttingDown),
            sent = self.tx.send(cmd) => sent.map_err(|_| NodeError::ShuttingDown),
        }
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryQuery,
    ) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.submit(RegistryCommand::Query(build(reply))).await?;
        tokio::select! {
            biased;
            _ = self.shutdown.fired() => Err(NodeError::ShuttingDown),
            answer = rx => answer.map_err(|_| NodeError::ShuttingDown),
        }
    }

    pub async fn add_peer(&self, session: Arc<PeerSession>) -> Result<(), NodeError> {
        self.submit(RegistryCommand::AddPeer(session)).await
    }

    pub async fn done_peer(&self, session: Arc<PeerSession>) -> Result<(), NodeError> {
        self.submit(RegistryCommand::DonePeer(session)).await
    }

    pub async fn update_peer_heights(
        &self,
        hash: BlockHash,
        height: i32,
        origin: Option<PeerId>,
    ) -> Result<(), NodeError> {
        self.submit(RegistryCommand::UpdatePeerHeights {
            hash,
            height,
            origin,
        })
        .await
    }

    pub async fn connected_count(&self) -> Result<usize, NodeError> {
        self.ask(RegistryQuery::ConnectedCount).await
    }

    pub async fn peers(&self) -> Result<Vec<Arc<PeerSession>>, NodeError> {
        self.ask(RegistryQuery::Peers).await
    }

    pub async fn peer_by_addr(&self, addr: SocketAddr) -> Result<Option<Arc<PeerSession>>, NodeError> {
        self.ask(|reply| RegistryQuery::PeerByAddr { addr, reply }).await
    }

    pub async fn outbound_groups(&self) -> Result<HashMap<String, usize>, NodeError> {
        self.ask(RegistryQuery::OutboundGroups).await
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot, NodeError> {
        self.ask(RegistryQuery::Snapshot).await
    }
}

pub struct PeerRegistry {
    ctx: Arc<ServiceContext>,
    supervisor: ConnectionSupervisor,
    rx: mpsc::Receiver<RegistryCommand>,
    state: PeerState,
    first_peer: Option<oneshot::Sender<()>>,
}

impl PeerRegistry {
    pub fn new(
        ctx: Arc<ServiceContext>,
        supervisor: ConnectionSupervisor,
        rx: mpsc::Receiver<RegistryCommand>,
        first_peer: oneshot::Sender<()>,
    ) -> Self {
        Self {
            ctx,
            supervisor,
            rx,
            state: PeerState::new(),
            first_peer: Some(first_peer),
        }
    }

    /// Process commands until shutdown, then disconnect every peer and drain
    /// whatever is still queued.
    pub async fn run(mut self) {
        let shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.fired() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }

        for session in self.state.sessions() {
            session.disconnect();
        }
        self.rx.close();
        let mut drained = 0usize;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        self.ctx.metrics.peer_count.set(0);
        tracing::debug!(drained, "peer registry stopped");
    }

    pub fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::AddPeer(session) => self.handle_add_peer(session),
            RegistryCommand::DonePeer(session) => self.handle_done_peer(session),
            RegistryCommand::UpdatePeerHeights {
                hash,
                height,
                origin,
            } => self.handle_update_peer_heights(hash, height, origin),
            RegistryCommand::Query(query) => self.handle_query(query),
        }
    }

    fn handle_add_peer(&mut self, session: Arc<PeerSession>) {
        let id = session.id();
        if self.ctx.is_shutting_down() {
            tracing::info!(peer = %id, addr = %session.addr(), "new peer while shutting down, disconnecting");
            session.disconnect();
            return;
        }
        if self.ctx.ban_ledger.is_banned(&session.addr().to_string()) {
            tracing::info!(peer = %id, addr = %session.addr(), "peer is banned, disconnecting");
            session.disconnect();
            return;
        }
        if self.state.count() >= self.ctx.config.max_peers {
            tracing::info!(
                peer = %id,
                addr = %session.addr(),
                max_peers = self.ctx.config.max_peers,
                "max peers reached, disconnecting"
            );
            session.disconnect();
            return;
        }

        let group = (!session.inbound()).then(|| session.net_address().group_key());
        let entry = PeerEntry::new(Arc::downgrade(&session), group);
        if !self.state.insert(id, session.persistent(), entry) {
            tracing::debug!(peer = %id, "peer already registered");
            return;
        }
        tracing::info!(
            peer = %id,
            addr = %session.addr(),
            persistent = session.persistent(),
            peers = self.state.count(),
            "new peer connected"
        );
        self.ctx.metrics.peer_count.set(self.state.count() as i64);

        if let Some(first) = self.first_peer.take() {
            let _ = first.send(());
        }
        if session.verack_received() {
            self.ctx
                .address_source
                .mark_connected(&session.net_address());
        }
    }

    fn handle_done_peer(&mut self, session: Arc<PeerSession>) {
        let id = session.id();
        if self.state.remove(id).is_some() {
            tracing::info!(peer = %id, addr = %session.addr(), peers = self.state.count(), "removed peer");
            self.ctx.metrics.peer_count.set(self.state.count() as i64);
        }
        if let Some(req) = session.conn_req() {
            self.supervisor.release(req);
        }
    }

    fn handle_update_peer_heights(&mut self, hash: BlockHash, height: i32, origin: Option<PeerId>) {
        for session in self.state.sessions() {
            if Some(session.id()) == origin {
                continue;
            }
            if session.last_announced_block() == Some(hash) {
                session.update_last_block_height(height);
                session.update_last_announced_block(None);
            }
        }
    }

    fn handle_query(&mut self, query: RegistryQuery) {
        match query {
            RegistryQuery::ConnectedCount(reply) => {
                let count = self
                    .state
                    .sessions()
                    .iter()
                    .filter(|s| s.is_connected())
                    .count();
                let _ = reply.send(count);
            }
            RegistryQuery::Peers(reply) => {
                let _ = reply.send(self.state.sessions());
            }
            RegistryQuery::PeerByAddr { addr, reply } => {
                let found = self
                    .state
                    .sessions()
                    .into_iter()
                    .find(|s| s.addr() == addr);
                let _ = reply.send(found);
            }
            RegistryQuery::OutboundGroups(reply) => {
                let _ = reply.send(self.state.outbound_groups().clone());
            }
            RegistryQuery::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }
}
