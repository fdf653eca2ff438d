//! Peer session: the protocol state machine of one connected peer.
//!
//! A session is driven by its own task ([`PeerSession::run`]). It negotiates
//! the version handshake, feeds inventory and headers to the sync manager,
//! deduplicates transaction announcements, merges gossiped addresses and
//! fans every received message out to raw-message subscribers.
//! Registration and removal go through the registry actor.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use cfnode_messages::{
    AddrMessage, FeeFilterMessage, InvMessage, InvVect, Message, RejectMessage, VersionMessage,
    MAX_ADDR_PER_MSG, MAX_INV_PER_MSG, NET_ADDRESS_TIME_VERSION, PROTOCOL_VERSION,
    SEND_HEADERS_VERSION,
};
use cfnode_network::{NetworkError, PeerId, PeerMessage, ProtocolDriver, Signal, SubscriberSet};
use cfnode_types::{is_valid_amount, BlockHash, NetAddress, ServiceFlags, Timestamp, Transaction, Txid};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::supervisor::ConnReq;

/// Transient score for a repeated version message.
pub const DUPLICATE_VERSION_SCORE: u32 = 1;
/// Persistent score for inv/addr messages over the protocol limit.
pub const OVERSIZED_MESSAGE_SCORE: u32 = 20;
/// Gossiped addresses stamped further ahead than this are treated as stale.
const ADDR_FUTURE_SLACK_SECS: u64 = 10 * 60;
const ADDR_STALE_AGE_SECS: u64 = 5 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    VersionSent,
    VersionReceived,
    Active,
    Disconnecting,
    Done,
}

#[derive(Clone, Debug, Default)]
struct Negotiated {
    protocol_version: Option<u32>,
    services: ServiceFlags,
    user_agent: String,
    start_height: i32,
    last_block_height: i32,
    last_announced_block: Option<BlockHash>,
    verack_received: bool,
}

/// Read-only snapshot of a session for callers outside the peer task.
#[derive(Clone, Debug, Serialize)]
pub struct PeerDescriptor {
    pub id: u64,
    pub addr: String,
    pub inbound: bool,
    pub persistent: bool,
    pub state: SessionState,
    pub services: u64,
    pub protocol_version: Option<u32>,
    pub user_agent: String,
    pub start_height: i32,
    pub last_block_height: i32,
    pub fee_filter: i64,
    pub verack_received: bool,
    pub connected_at: Timestamp,
}

pub struct PeerSession {
    id: PeerId,
    addr: SocketAddr,
    inbound: bool,
    conn_req: Option<ConnReq>,
    driver: Arc<dyn ProtocolDriver>,
    state: Mutex<SessionState>,
    negotiated: RwLock<Negotiated>,
    fee_filter: AtomicI64,
    /// Set once the sync manager has been told about this peer.
    sync_candidate: AtomicBool,
    known_addresses: Mutex<HashSet<String>>,
    subscribers: SubscriberSet,
    connected_at: Timestamp,
    ctx: Arc<ServiceContext>,
}

impl PeerSession {
    pub fn new(
        ctx: Arc<ServiceContext>,
        driver: Arc<dyn ProtocolDriver>,
        addr: SocketAddr,
        inbound: bool,
        conn_req: Option<ConnReq>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ctx.peer_ids.allocate(),
            addr,
            inbound,
            conn_req,
            driver,
            state: Mutex::new(SessionState::Connecting),
            negotiated: RwLock::new(Negotiated::default()),
            fee_filter: AtomicI64::new(0),
            sync_candidate: AtomicBool::new(false),
            known_addresses: Mutex::new(HashSet::new()),
            subscribers: SubscriberSet::new(),
            connected_at: ctx.clock.now(),
            ctx,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The peer's address with the services it advertised.
    pub fn net_address(&self) -> NetAddress {
        NetAddress::from_socket(self.addr, self.services(), self.ctx.clock.now())
    }

    pub fn inbound(&self) -> bool {
        self.inbound
    }

    pub fn persistent(&self) -> bool {
        self.conn_req.as_ref().is_some_and(|req| req.permanent)
    }

    pub fn conn_req(&self) -> Option<&ConnReq> {
        self.conn_req.as_ref()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn version_known(&self) -> bool {
        self.negotiated.read().protocol_version.is_some()
    }

    /// Negotiated protocol version, 0 before the handshake.
    pub fn protocol_version(&self) -> u32 {
        self.negotiated.read().protocol_version.unwrap_or(0)
    }

    pub fn services(&self) -> ServiceFlags {
        self.negotiated.read().services
    }

    pub fn verack_received(&self) -> bool {
        self.negotiated.read().verack_received
    }

    pub fn last_block_height(&self) -> i32 {
        self.negotiated.read().last_block_height
    }

    pub fn update_last_block_height(&self, height: i32) {
        self.negotiated.write().last_block_height = height;
    }

    pub fn last_announced_block(&self) -> Option<BlockHash> {
        self.negotiated.read().last_announced_block
    }

    pub fn update_last_announced_block(&self, hash: Option<BlockHash>) {
        self.negotiated.write().last_announced_block = hash;
    }

    /// Minimum fee rate the peer asked us to respect.
    pub fn fee_filter(&self) -> i64 {
        self.fee_filter.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    /// Whether an address was gossiped by this peer.
    pub fn knows_address(&self, key: &str) -> bool {
        self.known_addresses.lock().contains(key)
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        let negotiated = self.negotiated.read().clone();
        PeerDescriptor {
            id: self.id.as_u64(),
            addr: self.addr.to_string(),
            inbound: self.inbound,
            persistent: self.persistent(),
            state: self.state(),
            services: negotiated.services.bits(),
            protocol_version: negotiated.protocol_version,
            user_agent: negotiated.user_agent,
            start_height: negotiated.start_height,
            last_block_height: negotiated.last_block_height,
            fee_filter: self.fee_filter(),
            verack_received: negotiated.verack_received,
            connected_at: self.connected_at,
        }
    }

    /// Queue a message to the peer, accounting its size as sent.
    pub fn queue_message(&self, msg: Message) -> Result<(), NetworkError> {
        let size = msg.serialized_size();
        let command = msg.command();
        match self.driver.queue_message(msg) {
            Ok(()) => {
                self.ctx.metrics.bytes_sent.inc_by(size);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(peer = %self.id, command, error = %e, "failed to queue message");
                Err(e)
            }
        }
    }

    /// Begin disconnecting. Idempotent.
    pub fn disconnect(&self) {
        self.set_state(SessionState::Disconnecting);
        self.driver.disconnect();
    }

    /// Receive a copy of every message this peer sends until `quit` fires.
    pub fn subscribe(&self, queue: mpsc::Sender<PeerMessage>, quit: Signal) -> u64 {
        self.subscribers.subscribe(queue, quit)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.unsubscribe(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Add to the peer's ban score, disconnecting if it crossed the threshold.
    pub fn add_ban_score(&self, persistent: u32, transient: u32, reason: &str) -> bool {
        let banned =
            self.ctx
                .ban_ledger
                .add_ban_score(&self.addr.to_string(), persistent, transient, reason);
        if banned {
            self.ctx.metrics.bans.inc();
            self.disconnect();
        }
        banned
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        match (*state, next) {
            (SessionState::Done, _) => {}
            (SessionState::Disconnecting, next) if next != SessionState::Done => {}
            _ => *state = next,
        }
    }

    fn local_version(&self) -> VersionMessage {
        VersionMessage {
            protocol_version: PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            timestamp: self.ctx.clock.now(),
            nonce: self.ctx.local_nonce,
            user_agent: self.ctx.config.user_agent(),
            start_height: self.ctx.best_height(),
            disable_relay_tx: false,
        }
    }

    /// Send our version if we initiated the connection.
    pub fn start(&self) {
        if self.inbound {
            return;
        }
        match self.queue_message(Message::Version(self.local_version())) {
            Ok(()) => self.set_state(SessionState::VersionSent),
            Err(_) => self.disconnect(),
        }
    }

    /// Peer task: process messages until the link closes or shutdown fires,
    /// then hand the session back to the registry.
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<Message>) {
        self.start();
        let closed = self.driver.closed();
        let shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.fired() => {
                    self.disconnect();
                    break;
                }
                _ = closed.fired() => break,
                msg = incoming.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }
        self.finish().await;
    }

    async fn finish(self: &Arc<Self>) {
        self.disconnect();
        if let Err(e) = self.ctx.registry.done_peer(self.clone()).await {
            tracing::debug!(peer = %self.id, error = %e, "registry gone before peer removal");
        }
        if self.sync_candidate.swap(false, Ordering::AcqRel) {
            self.ctx.sync_manager.done_peer(self);
        }
        self.subscribers.clear();
        self.set_state(SessionState::Done);
        tracing::debug!(peer = %self.id, addr = %self.addr, "peer task finished");
    }

    pub async fn handle_message(self: &Arc<Self>, msg: Message) {
        self.on_read(&msg);
        match msg {
            Message::Version(version) => self.on_version(version).await,
            other if !self.version_known() => {
                tracing::warn!(
                    peer = %self.id,
                    addr = %self.addr,
                    command = other.command(),
                    "message before version, disconnecting"
                );
                self.disconnect();
            }
            Message::Verack => self.on_verack(),
            Message::Inv(inv) => self.on_inv(inv),
            Message::Headers(headers) => self.ctx.sync_manager.queue_headers(&headers, self),
            Message::Addr(addr) => self.on_addr(addr),
            Message::Tx(tx) => self.on_tx(tx),
            Message::FeeFilter(filter) => self.on_fee_filter(filter),
            Message::Reject(reject) => self.on_reject(&reject),
            Message::Ping(nonce) => {
                let _ = self.queue_message(Message::Pong(nonce));
            }
            other => {
                tracing::trace!(peer = %self.id, command = other.command(), "no handler");
            }
        }
    }

    fn on_read(&self, msg: &Message) {
        self.ctx.metrics.bytes_received.inc_by(msg.serialized_size());
        let published = self.subscribers.publish(self.id, msg);
        if published.dropped > 0 {
            self.ctx.metrics.fanout_dropped.inc_by(published.dropped as u64);
        }
    }

    async fn on_version(self: &Arc<Self>, version: VersionMessage) {
        if self.version_known() {
            tracing::debug!(peer = %self.id, "duplicate version message");
            self.add_ban_score(0, DUPLICATE_VERSION_SCORE, "duplicate version message");
            return;
        }
        if !self.inbound && version.nonce == self.ctx.local_nonce {
            tracing::info!(peer = %self.id, addr = %self.addr, "connected to self, disconnecting");
            self.disconnect();
            return;
        }
        {
            let mut negotiated = self.negotiated.write();
            negotiated.protocol_version = Some(version.protocol_version.min(PROTOCOL_VERSION));
            negotiated.services = version.services;
            negotiated.user_agent = version.user_agent.clone();
            negotiated.start_height = version.start_height;
            negotiated.last_block_height = version.start_height;
        }
        self.set_state(SessionState::VersionReceived);

        if version.disable_relay_tx {
            tracing::info!(peer = %self.id, addr = %self.addr, "peer does not relay transactions, disconnecting");
            self.disconnect();
            return;
        }
        let required = self.ctx.config.required_services;
        if !version.services.contains(required) {
            tracing::info!(
                peer = %self.id,
                addr = %self.addr,
                services = %version.services,
                required = %required,
                "peer lacks required services, disconnecting"
            );
            self.disconnect();
            return;
        }

        self.ctx.time_source.add_sample(
            &self.addr.ip().to_string(),
            version.timestamp,
            self.ctx.clock.now(),
        );

        if let Err(e) = self.answer_version(version.services) {
            tracing::debug!(peer = %self.id, error = %e, "handshake reply failed, disconnecting");
            self.disconnect();
            return;
        }

        self.sync_candidate.store(true, Ordering::Release);
        self.ctx.sync_manager.new_peer(self);

        if let Err(e) = self.ctx.registry.add_peer(self.clone()).await {
            tracing::debug!(peer = %self.id, error = %e, "could not register peer");
            self.disconnect();
        }
    }

    fn answer_version(&self, services: ServiceFlags) -> Result<(), NetworkError> {
        if self.inbound {
            self.queue_message(Message::Version(self.local_version()))?;
        }
        self.queue_message(Message::Verack)?;

        if !self.ctx.config.network.is_simnet() {
            let source = self.ctx.address_source.as_ref();
            if source.need_more_addresses() && self.protocol_version() >= NET_ADDRESS_TIME_VERSION {
                self.queue_message(Message::GetAddr)?;
            }
            let own = self.net_address();
            source.add_addresses(&[own], &own);
            source.mark_good(&own);
            if !self.inbound {
                source.set_services(&own, services);
            }
        }
        Ok(())
    }

    fn on_verack(&self) {
        {
            let mut negotiated = self.negotiated.write();
            if negotiated.verack_received {
                tracing::debug!(peer = %self.id, "duplicate verack");
                return;
            }
            negotiated.verack_received = true;
        }
        self.set_state(SessionState::Active);
        if self.protocol_version() >= SEND_HEADERS_VERSION {
            if let Err(e) = self.queue_message(Message::SendHeaders) {
                tracing::debug!(peer = %self.id, error = %e, "sendheaders failed, disconnecting");
                self.disconnect();
                return;
            }
        }
        self.ctx.address_source.mark_connected(&self.net_address());
        tracing::debug!(peer = %self.id, addr = %self.addr, "handshake complete");
    }

    fn on_inv(self: &Arc<Self>, inv: InvMessage) {
        if inv.items.len() > MAX_INV_PER_MSG {
            self.add_ban_score(OVERSIZED_MESSAGE_SCORE, 0, "oversized inv message");
            self.disconnect();
            return;
        }
        if let Some(hash) = inv.items.iter().rev().find_map(InvVect::block_hash) {
            self.update_last_announced_block(Some(hash));
        }
        self.ctx.inv_waiters.notify(self.id, &inv);
        self.ctx.sync_manager.queue_inv(&inv, self);
        self.inv_txn(&inv);
    }

    /// Request announced transactions nobody asked for within the window.
    /// Only runs while someone listens for transactions.
    fn inv_txn(&self, inv: &InvMessage) {
        if self.ctx.tx_events.receiver_count() == 0 {
            return;
        }
        let announced: Vec<Txid> = inv.items.iter().filter_map(InvVect::txid).collect();
        if announced.is_empty() {
            return;
        }
        let fresh = self.ctx.known_txns.lock().filter_new(announced, Instant::now());
        if fresh.is_empty() {
            return;
        }
        let witness = self.services().contains(ServiceFlags::WITNESS);
        let items: Vec<InvVect> = fresh
            .into_iter()
            .map(|txid| {
                if witness {
                    InvVect::witness_tx(txid)
                } else {
                    InvVect::tx(txid)
                }
            })
            .collect();
        tracing::debug!(peer = %self.id, count = items.len(), "requesting announced transactions");
        let _ = self.queue_message(Message::GetData(InvMessage::new(items)));
    }

    fn on_addr(&self, msg: AddrMessage) {
        if self.ctx.config.network.is_simnet() || self.protocol_version() < NET_ADDRESS_TIME_VERSION {
            return;
        }
        if msg.addresses.is_empty() {
            tracing::warn!(peer = %self.id, addr = %self.addr, "addr message without addresses, disconnecting");
            self.disconnect();
            return;
        }
        if msg.addresses.len() > MAX_ADDR_PER_MSG {
            self.add_ban_score(OVERSIZED_MESSAGE_SCORE, 0, "oversized addr message");
            self.disconnect();
            return;
        }

        let now = self.ctx.clock.now();
        let required = self.ctx.config.required_services;
        let mut accepted = Vec::with_capacity(msg.addresses.len());
        {
            let mut known = self.known_addresses.lock();
            for mut na in msg.addresses {
                if !self.driver.is_connected() {
                    return;
                }
                if !na.services.contains(required) {
                    continue;
                }
                if na.timestamp > now.plus_secs(ADDR_FUTURE_SLACK_SECS) {
                    na.timestamp = now.minus_secs(ADDR_STALE_AGE_SECS);
                }
                known.insert(na.key());
                accepted.push(na);
            }
        }
        if accepted.is_empty() {
            return;
        }
        tracing::debug!(peer = %self.id, count = accepted.len(), "merging gossiped addresses");
        self.ctx
            .address_source
            .add_addresses(&accepted, &self.net_address());
    }

    fn on_tx(&self, tx: Transaction) {
        if self.ctx.tx_events.send(tx).is_err() {
            tracing::trace!(peer = %self.id, "no transaction listeners");
        }
    }

    fn on_fee_filter(&self, msg: FeeFilterMessage) {
        if !is_valid_amount(msg.min_fee) {
            tracing::warn!(peer = %self.id, fee = msg.min_fee, "invalid fee filter, disconnecting");
            self.disconnect();
            return;
        }
        self.fee_filter.store(msg.min_fee, Ordering::Relaxed);
    }

    fn on_reject(&self, msg: &RejectMessage) {
        tracing::debug!(
            peer = %self.id,
            command = %msg.command,
            code = ?msg.code,
            reason = %msg.reason,
            "peer rejected message"
        );
    }
}
