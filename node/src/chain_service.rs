//! The chain service: owns every long-running task of the light node and
//! exposes the operations wallets and indexers call.
//!
//! Construction wires the components together; [`ChainService::start`]
//! spawns them and [`ChainService::stop`] fires the shared shutdown signal
//! and waits until every task has exited.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfnode_messages::{GetCFiltersMessage, InvMessage, InvVect, Message};
use cfnode_network::{
    AddressSource, BanLedger, Dialer, InvSighting, InvWaiters, KnownTxns, MedianTime, ModeFlag,
    PeerId, PeerIdAllocator, PeerLink, SearchMode, Signal, Trigger,
};
use cfnode_store::{BanStore, HeaderStore};
use cfnode_store_lmdb::{LmdbEnvironment, DEFAULT_MAP_SIZE};
use cfnode_types::{
    Block, BlockHash, BlockHeader, BlockStamp, Clock, FilterHash, GcsFilter, NetAddress,
    ServiceFlags, Timestamp, Transaction, Txid,
};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::broadcaster::{Broadcaster, PeerAnnouncer};
use crate::candidates::OutboundCandidates;
use crate::config::ChainServiceConfig;
use crate::context::{ServiceContext, TX_EVENT_CAPACITY};
use crate::events::{BlockEvent, BLOCK_EVENT_CAPACITY};
use crate::filter_scan::{self, ChainSource, FilterBlocksRequest, FilterBlocksResponse};
use crate::metrics::NodeMetrics;
use crate::pending_filters::PendingFilters;
use crate::query::{BatchReport, PeerSelection, QueryDescriptor, QueryDispatcher, QueryOptions};
use crate::registry::{PeerRegistry, RegistryHandle, REGISTRY_QUEUE_CAPACITY};
use crate::session::{PeerDescriptor, PeerSession};
use crate::shutdown::{ShutdownController, TaskTracker};
use crate::supervisor::{Connected, ConnectionSupervisor, SupervisorConfig};
use crate::sync_manager::SyncManager;
use crate::NodeError;

/// Peers asked for a filter or block at once.
const FETCH_PEERS: usize = 3;
/// Capacity of the established-connection queue.
const CONNECTED_QUEUE_CAPACITY: usize = 32;
const LMDB_MAX_DBS: u32 = 4;

/// Collaborators supplied by the embedding application.
pub struct ChainServiceDeps {
    pub header_store: Arc<dyn HeaderStore>,
    pub address_source: Arc<dyn AddressSource>,
    pub sync_manager: Arc<dyn SyncManager>,
    pub dialer: Arc<dyn Dialer>,
    /// Where bans are persisted; `None` keeps them in memory only.
    pub ban_store: Option<Arc<dyn BanStore>>,
    pub clock: Arc<dyn Clock>,
}

/// Open the LMDB ban store under the configured data directory.
pub fn open_lmdb_ban_store(config: &ChainServiceConfig) -> Result<Arc<dyn BanStore>, NodeError> {
    let env = LmdbEnvironment::open(&config.data_dir.join("bans"), LMDB_MAX_DBS, DEFAULT_MAP_SIZE)?;
    Ok(Arc::new(env.ban_store()?))
}

/// Receivers handed to tasks on start.
struct Startup {
    registry: PeerRegistry,
    connected: mpsc::Receiver<Connected>,
    first_peer: oneshot::Receiver<()>,
}

/// Applies the fast/relaxed policy to the current peer count.
#[derive(Clone)]
struct ModeEvaluator {
    ctx: Arc<ServiceContext>,
    mode: Arc<ModeFlag>,
}

impl ModeEvaluator {
    async fn evaluate(&self) -> Result<SearchMode, NodeError> {
        let peers = self.ctx.registry.connected_count().await?;
        let has_sync_peer = self.ctx.sync_manager.sync_peer().is_some();
        let current = self.mode.get();
        let next = self
            .ctx
            .config
            .mode_policy()
            .next_mode(current, peers, has_sync_peer);
        if next != current {
            tracing::info!(from = ?current, to = ?next, peers, has_sync_peer, "address search mode changed");
            self.mode.set(next);
            self.ctx
                .metrics
                .relaxed_mode
                .set(i64::from(next == SearchMode::Relaxed));
        }
        Ok(next)
    }
}

pub struct ChainService {
    ctx: Arc<ServiceContext>,
    supervisor: ConnectionSupervisor,
    dispatcher: QueryDispatcher,
    broadcaster: Arc<Broadcaster>,
    mode: ModeEvaluator,
    pending_filters: PendingFilters,
    filter_cache: Mutex<LruCache<BlockHash, GcsFilter>>,
    block_cache: Mutex<LruCache<BlockHash, Block>>,
    block_events: broadcast::Sender<BlockEvent>,
    first_peer: Trigger,
    shutdown: ShutdownController,
    tasks: Arc<TaskTracker>,
    startup: Mutex<Option<Startup>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ChainService {
    pub fn new(config: ChainServiceConfig, deps: ChainServiceDeps) -> Result<Self, NodeError> {
        let config = Arc::new(config.validate()?);
        let shutdown = ShutdownController::new();
        let tasks = Arc::new(TaskTracker::new());
        let metrics = Arc::new(NodeMetrics::new());

        let ban_ledger = Arc::new(match deps.ban_store {
            Some(store) => BanLedger::with_store(config.ban_config(), deps.clock.clone(), store)?,
            None => BanLedger::new(config.ban_config(), deps.clock.clone()),
        });

        let (registry, registry_rx) = RegistryHandle::channel(REGISTRY_QUEUE_CAPACITY, shutdown.signal());
        let (tx_events, _) = broadcast::channel(TX_EVENT_CAPACITY);
        let (block_events, _) = broadcast::channel(BLOCK_EVENT_CAPACITY);
        let local_nonce = rand::random::<u64>();

        let ctx = Arc::new(ServiceContext {
            config: config.clone(),
            clock: deps.clock.clone(),
            header_store: deps.header_store,
            address_source: deps.address_source.clone(),
            sync_manager: deps.sync_manager,
            ban_ledger: ban_ledger.clone(),
            registry: registry.clone(),
            time_source: MedianTime::new(),
            known_txns: Mutex::new(KnownTxns::new(config.known_txn_window())),
            inv_waiters: InvWaiters::new(),
            tx_events,
            metrics: metrics.clone(),
            peer_ids: PeerIdAllocator::new(),
            shutdown: shutdown.signal(),
            local_nonce,
        });

        let mode_flag = Arc::new(ModeFlag::default());
        // Simnet only ever dials the peers it was told about.
        let candidates: Option<Arc<dyn crate::supervisor::CandidateSource>> =
            if config.connect_peers.is_empty() && !config.network.is_simnet() {
                Some(Arc::new(OutboundCandidates::new(
                    deps.address_source,
                    ban_ledger,
                    registry.clone(),
                    mode_flag.clone(),
                    deps.clock.clone(),
                    config.network.default_port(),
                )))
            } else {
                None
            };

        let (connected_tx, connected_rx) = mpsc::channel(CONNECTED_QUEUE_CAPACITY);
        let supervisor = ConnectionSupervisor::new(
            SupervisorConfig {
                target_outbound: config.target_outbound,
                retry_interval: config.connection_retry_interval(),
            },
            deps.dialer,
            candidates,
            connected_tx,
            shutdown.signal(),
            tasks.clone(),
        );

        let (first_peer_tx, first_peer_rx) = oneshot::channel();
        let peer_registry = PeerRegistry::new(ctx.clone(), supervisor.clone(), registry_rx, first_peer_tx);
        let (first_peer, _) = cfnode_network::signal_pair();

        let dispatcher = QueryDispatcher::new(registry.clone(), deps.clock, metrics.clone(), shutdown.signal());
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(PeerAnnouncer::new(registry)),
            config.rebroadcast_interval(),
            metrics,
        ));

        Ok(Self {
            supervisor,
            dispatcher,
            broadcaster,
            mode: ModeEvaluator {
                ctx: ctx.clone(),
                mode: mode_flag,
            },
            pending_filters: PendingFilters::new(),
            filter_cache: Mutex::new(LruCache::new(cache_size(config.filter_cache_size))),
            block_cache: Mutex::new(LruCache::new(cache_size(config.block_cache_size))),
            block_events,
            first_peer,
            shutdown,
            tasks,
            startup: Mutex::new(Some(Startup {
                registry: peer_registry,
                connected: connected_rx,
                first_peer: first_peer_rx,
            })),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            ctx,
        })
    }

    /// Spawn every background task. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), NodeError> {
        if self.ctx.is_shutting_down() {
            return Err(NodeError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(startup) = self.startup.lock().take() else {
            return Ok(());
        };
        let config = &self.ctx.config;
        tracing::info!(
            network = config.network.as_str(),
            target_outbound = config.target_outbound,
            max_peers = config.max_peers,
            "starting chain service"
        );

        // ── Peer registry ───────────────────────────────────────────────
        self.tasks.spawn(startup.registry.run());

        // ── First-peer notification ─────────────────────────────────────
        let first_peer = self.first_peer.clone();
        let shutdown = self.ctx.shutdown.clone();
        let first_peer_rx = startup.first_peer;
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.fired() => {}
                res = first_peer_rx => {
                    if res.is_ok() {
                        first_peer.fire();
                    }
                }
            }
        });

        // ── Established connections → peer sessions ─────────────────────
        self.tasks.spawn(handle_connections(
            self.ctx.clone(),
            self.supervisor.clone(),
            startup.connected,
            self.tasks.clone(),
        ));

        // ── Search-mode evaluation ──────────────────────────────────────
        let evaluator = self.mode.clone();
        let period = config.mode_eval_interval();
        let shutdown = self.ctx.shutdown.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.fired() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = evaluator.evaluate().await {
                            tracing::debug!(error = %e, "search mode evaluation skipped");
                        }
                    }
                }
            }
        });

        // ── Rebroadcast on new blocks ───────────────────────────────────
        self.tasks.spawn(
            self.broadcaster
                .clone()
                .run(self.block_events.subscribe(), self.ctx.shutdown.clone()),
        );

        // ── DNS seeds ───────────────────────────────────────────────────
        if !config.network.is_simnet() && !config.dns_seeds.is_empty() {
            self.tasks.spawn(seed_addresses(
                config.dns_seeds.clone(),
                config.network.default_port(),
                self.ctx.address_source.clone(),
                self.ctx.clock.clone(),
                self.ctx.shutdown.clone(),
            ));
        }

        // ── Persistent peers ────────────────────────────────────────────
        for peer in config.connect_peers.iter().chain(config.add_peers.iter()) {
            self.tasks.spawn(connect_persistent(
                peer.clone(),
                config.network.default_port(),
                self.supervisor.clone(),
                config.connection_retry_interval(),
                self.ctx.shutdown.clone(),
            ));
        }

        self.supervisor.start();
        Ok(())
    }

    /// Fire shutdown and wait for every task to exit. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("chain service stopping");
        self.shutdown.shutdown();
        self.tasks.join_all().await;
        tracing::info!("chain service stopped");
    }

    /// Tip usable for scanning: the lower of the block and filter tips.
    pub fn best_block(&self) -> Result<BlockStamp, NodeError> {
        let store = &self.ctx.header_store;
        let (mut header, mut height) = store.chain_tip()?;
        let (_, filter_height) = store.filter_tip()?;
        if filter_height < height {
            header = store.header_by_height(filter_height)?;
            height = filter_height;
        }
        Ok(BlockStamp {
            height,
            hash: header.block_hash(),
            timestamp: header.time(),
        })
    }

    pub fn get_block_hash(&self, height: u32) -> Result<BlockHash, NodeError> {
        Ok(self.ctx.header_store.header_by_height(height)?.block_hash())
    }

    pub fn get_block_header(&self, hash: &BlockHash) -> Result<BlockHeader, NodeError> {
        Ok(self.ctx.header_store.header_by_hash(hash)?.0)
    }

    pub fn get_block_height(&self, hash: &BlockHash) -> Result<u32, NodeError> {
        Ok(self.ctx.header_store.header_by_hash(hash)?.1)
    }

    /// Scan `req.blocks` for the first block relevant to the watch list.
    pub async fn filter_blocks(
        &self,
        req: &FilterBlocksRequest,
    ) -> Result<Option<FilterBlocksResponse>, NodeError> {
        let found = filter_scan::filter_blocks(self, req, self.ctx.config.poll_policy()).await?;
        if found.is_some() {
            self.ctx.metrics.filter_matches.inc();
        }
        Ok(found)
    }

    pub async fn send_transaction(&self, tx: Transaction) -> Result<Txid, NodeError> {
        if self.ctx.is_shutting_down() {
            return Err(NodeError::ShuttingDown);
        }
        self.broadcaster.broadcast(tx).await
    }

    /// Stop rebroadcasting a transaction. Returns whether it was pending.
    pub fn mark_tx_confirmed(&self, txid: &Txid) -> bool {
        self.broadcaster.mark_confirmed(txid)
    }

    pub async fn peers(&self) -> Result<Vec<PeerDescriptor>, NodeError> {
        let peers = self.ctx.registry.peers().await?;
        Ok(peers.iter().map(|p| p.descriptor()).collect())
    }

    /// Whether `addr` (`ip` or `ip:port`) is banned.
    pub fn is_banned(&self, addr: &str) -> bool {
        self.ctx.ban_ledger.is_banned(addr)
    }

    pub fn ban_mgr(&self) -> Arc<BanLedger> {
        self.ctx.ban_ledger.clone()
    }

    pub fn get_active_queries(&self) -> Vec<QueryDescriptor> {
        self.dispatcher.active_queries()
    }

    /// Whether headers and filter headers have caught up.
    pub fn is_current(&self) -> bool {
        self.ctx.sync_manager.is_current()
    }

    /// A block was accepted at `height`: every peer other than `origin` that
    /// announced it now reports that height.
    pub async fn update_peer_heights(
        &self,
        hash: BlockHash,
        height: i32,
        origin: Option<PeerId>,
    ) -> Result<(), NodeError> {
        self.ctx.registry.update_peer_heights(hash, height, origin).await
    }

    /// Publish a new best block.
    pub fn notify_block_connected(&self, stamp: BlockStamp) {
        tracing::debug!(height = stamp.height, hash = %stamp.hash, "block connected");
        let _ = self.block_events.send(BlockEvent::Connected(stamp));
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_events.subscribe()
    }

    /// Roll the header store back to `height`, one block at a time, once no
    /// filter fetch above `height` is in flight. Returns the new tip.
    pub async fn rollback_to_height(&self, height: u32) -> Result<BlockStamp, NodeError> {
        self.pending_filters
            .wait_above(height, &self.ctx.shutdown)
            .await?;

        let store = &self.ctx.header_store;
        let (header, tip_height) = store.chain_tip()?;
        let mut tip = BlockStamp {
            height: tip_height,
            hash: header.block_hash(),
            timestamp: header.time(),
        };
        while tip.height > height {
            let new_tip = store.rollback_last_block()?;
            self.filter_cache.lock().pop(&tip.hash);
            self.block_cache.lock().pop(&tip.hash);
            tracing::info!(height = tip.height, hash = %tip.hash, "block disconnected");
            let _ = self.block_events.send(BlockEvent::Disconnected {
                stamp: tip,
                new_tip,
            });
            tip = new_tip;
        }
        Ok(tip)
    }

    /// Receive every inventory vector announcing `hash`.
    pub fn listen_invs(&self, hash: [u8; 32]) -> mpsc::Receiver<InvSighting> {
        self.ctx.inv_waiters.listen(hash)
    }

    pub fn stop_listen_invs(&self, hash: &[u8; 32]) {
        self.ctx.inv_waiters.stop(hash);
    }

    /// Transactions received from peers. While at least one receiver
    /// exists, announced transactions are requested.
    pub fn subscribe_txs(&self) -> broadcast::Receiver<Transaction> {
        self.ctx.tx_events.subscribe()
    }

    /// Local time corrected by the median offset of peers' clocks.
    pub fn adjusted_time(&self) -> Timestamp {
        self.ctx.time_source.adjusted(self.ctx.clock.now())
    }

    pub fn time_offset_secs(&self) -> i64 {
        self.ctx.time_source.offset_secs()
    }

    /// Total bytes (received, sent).
    pub fn net_totals(&self) -> (u64, u64) {
        self.ctx.metrics.net_totals()
    }

    pub async fn connected_count(&self) -> Result<usize, NodeError> {
        self.ctx.registry.connected_count().await
    }

    pub async fn peer_by_addr(&self, addr: SocketAddr) -> Result<Option<Arc<PeerSession>>, NodeError> {
        self.ctx.registry.peer_by_addr(addr).await
    }

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
        self.dispatcher.query_batch(requests, check, cancel, options).await
    }

    /// Resolves once the first peer has been registered.
    pub async fn first_peer_connected(&self) -> Result<(), NodeError> {
        let connected = self.first_peer.signal();
        tokio::select! {
            biased;
            _ = connected.fired() => Ok(()),
            _ = self.ctx.shutdown.fired() => Err(NodeError::ShuttingDown),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        "neutrino"
    }

    pub fn metrics(&self) -> Arc<NodeMetrics> {
        self.ctx.metrics.clone()
    }

    /// Current address-search mode.
    pub fn search_mode(&self) -> SearchMode {
        self.mode.mode.get()
    }

    /// Re-evaluate the address-search mode now. Also runs on every
    /// evaluation tick.
    pub async fn evaluate_search_mode(&self) -> Result<SearchMode, NodeError> {
        self.mode.evaluate().await
    }

    /// Fetch a block's compact filter, verified against the stored filter
    /// header. `Ok(None)` when the filter is not available yet.
    pub async fn get_cfilter(&self, hash: &BlockHash) -> Result<Option<GcsFilter>, NodeError> {
        let cached = self.filter_cache.lock().get(hash).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let store = &self.ctx.header_store;
        let (_, height) = store.header_by_hash(hash)?;
        let (_, filter_height) = store.filter_tip()?;
        if height > filter_height {
            tracing::trace!(height, filter_height, "filter header not synced yet");
            return Ok(None);
        }
        let expected = store.filter_header_by_height(height)?;
        let prev = match height {
            0 => FilterHash::ZERO,
            h => store.filter_header_by_height(h - 1)?,
        };

        let _pending = self.pending_filters.register(height);
        let found: Mutex<Option<GcsFilter>> = Mutex::new(None);
        let check = |peer: &PeerSession, _req: &Message, resp: &Message| match resp {
            Message::CFilter(msg) if msg.block_hash == *hash => {
                if FilterHash::chain(&msg.filter.to_bytes(), &prev) != expected {
                    tracing::warn!(peer = %peer.id(), height, "filter does not match filter header");
                    return false;
                }
                *found.lock() = Some(msg.filter.clone());
                true
            }
            _ => false,
        };
        let request = Message::GetCFilters(GetCFiltersMessage {
            start_height: height,
            stop_hash: *hash,
        });
        match self
            .dispatcher
            .query_batch(vec![request], check, Signal::never(), self.fetch_options())
            .await
        {
            Ok(_) => {}
            Err(NodeError::NoPeers) => {
                tracing::debug!(height, "no peers to fetch filter from");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let filter = found.into_inner();
        if let Some(filter) = &filter {
            self.ctx.metrics.filter_fetches.inc();
            self.filter_cache.lock().put(*hash, filter.clone());
        }
        Ok(filter)
    }

    /// Fetch a full block, checked against its header hash.
    pub async fn get_block(&self, hash: &BlockHash) -> Result<Block, NodeError> {
        let cached = self.block_cache.lock().get(hash).cloned();
        if let Some(block) = cached {
            return Ok(block);
        }
        let (_, height) = self.ctx.header_store.header_by_hash(hash)?;

        let found: Mutex<Option<Block>> = Mutex::new(None);
        let check = |_peer: &PeerSession, _req: &Message, resp: &Message| match resp {
            Message::Block(block) if block.block_hash() == *hash => {
                *found.lock() = Some(block.clone());
                true
            }
            _ => false,
        };
        let request = Message::GetData(InvMessage::new(vec![InvVect::witness_block(*hash)]));
        self.dispatcher
            .query_batch(vec![request], check, Signal::never(), self.fetch_options())
            .await?;

        let block = found.into_inner().ok_or(NodeError::BlockUnavailable(*hash))?;
        tracing::debug!(height, hash = %hash, txs = block.transactions.len(), "fetched block");
        self.ctx.metrics.block_fetches.inc();
        self.block_cache.lock().put(*hash, block.clone());
        Ok(block)
    }

    fn fetch_options(&self) -> QueryOptions {
        QueryOptions {
            timeout: self.ctx.config.query_timeout(),
            retries: self.ctx.config.query_retries,
            selection: PeerSelection::Best(FETCH_PEERS),
            queue_capacity: self.ctx.config.subscriber_queue_capacity,
        }
    }
}

#[async_trait]
impl ChainSource for ChainService {
    async fn get_cfilter(&self, hash: &BlockHash) -> Result<Option<GcsFilter>, NodeError> {
        ChainService::get_cfilter(self, hash).await
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<Block, NodeError> {
        ChainService::get_block(self, hash).await
    }
}

fn cache_size(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Turn established links into running peer sessions.
async fn handle_connections(
    ctx: Arc<ServiceContext>,
    supervisor: ConnectionSupervisor,
    mut connected: mpsc::Receiver<Connected>,
    tasks: Arc<TaskTracker>,
) {
    let shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.fired() => break,
            conn = connected.recv() => match conn {
                Some(conn) => accept_connection(&ctx, &supervisor, &tasks, conn).await,
                None => break,
            },
        }
    }
    tracing::debug!("connection handler stopped");
}

async fn accept_connection(
    ctx: &Arc<ServiceContext>,
    supervisor: &ConnectionSupervisor,
    tasks: &TaskTracker,
    conn: Connected,
) {
    let Connected { req, link } = conn;
    if ctx.ban_ledger.is_banned(&link.addr.to_string()) {
        tracing::info!(addr = %link.addr, "refusing connection to banned peer");
        link.driver.disconnect();
        supervisor.release(&req);
        return;
    }
    match ctx.registry.peer_by_addr(link.addr).await {
        Ok(None) => {}
        Ok(Some(existing)) => {
            tracing::info!(addr = %link.addr, peer = %existing.id(), "already connected to address");
            link.driver.disconnect();
            supervisor.release(&req);
            return;
        }
        Err(e) => {
            tracing::debug!(addr = %link.addr, error = %e, "dropping connection");
            link.driver.disconnect();
            return;
        }
    }
    let PeerLink {
        addr,
        inbound,
        driver,
        incoming,
    } = link;
    let session = PeerSession::new(ctx.clone(), driver, addr, inbound, Some(req));
    tracing::debug!(peer = %session.id(), addr = %addr, "starting peer session");
    tasks.spawn(session.run(incoming));
}

/// Resolve DNS seeds into the address source.
async fn seed_addresses(
    seeds: Vec<String>,
    port: u16,
    source: Arc<dyn AddressSource>,
    clock: Arc<dyn Clock>,
    shutdown: Signal,
) {
    for seed in seeds {
        let resolved = tokio::select! {
            biased;
            _ = shutdown.fired() => return,
            resolved = tokio::net::lookup_host((seed.as_str(), port)) => resolved,
        };
        match resolved {
            Ok(addrs) => {
                let now = clock.now();
                let addrs: Vec<NetAddress> = addrs
                    .map(|addr| NetAddress::from_socket(addr, ServiceFlags::NETWORK, now))
                    .collect();
                if let Some(first) = addrs.first() {
                    source.add_addresses(&addrs, first);
                }
                tracing::info!(seed = %seed, count = addrs.len(), "resolved DNS seed");
            }
            Err(e) => tracing::warn!(seed = %seed, error = %e, "DNS seed lookup failed"),
        }
    }
}

/// Resolve a configured peer and hand it to the supervisor as a permanent
/// request, retrying resolution until it succeeds or shutdown fires.
async fn connect_persistent(
    peer: String,
    default_port: u16,
    supervisor: ConnectionSupervisor,
    retry: Duration,
    shutdown: Signal,
) {
    loop {
        let resolved = tokio::select! {
            biased;
            _ = shutdown.fired() => return,
            resolved = resolve_peer(&peer, default_port) => resolved,
        };
        match resolved {
            Ok(addr) => {
                let id = supervisor.connect(addr, true);
                tracing::info!(peer = %peer, addr = %addr, req = %id, "connecting to persistent peer");
                return;
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "failed to resolve persistent peer"),
        }
        tokio::select! {
            biased;
            _ = shutdown.fired() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

async fn resolve_peer(peer: &str, default_port: u16) -> Result<SocketAddr, NodeError> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let has_port = peer
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let first = if has_port {
        tokio::net::lookup_host(peer).await?.next()
    } else {
        tokio::net::lookup_host((peer, default_port)).await?.next()
    };
    first.ok_or_else(|| NodeError::Config(format!("{peer} resolved to no addresses")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ConnReqId;
    use crate::test_support::{full_services, harness, Harness, RecordingSync};
    use cfnode_network::AddressBook;
    use cfnode_nullables::{
        handshake, peer_version, DialedLink, NullBanStore, NullClock, NullDialer, NullHeaderStore,
    };
    use cfnode_types::NetworkId;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        service: ChainService,
        headers: Arc<NullHeaderStore>,
        sync: Arc<RecordingSync>,
        links: mpsc::UnboundedReceiver<cfnode_nullables::DialedLink>,
    }

    fn fixture(config: ChainServiceConfig, headers: NullHeaderStore) -> Fixture {
        let book = Arc::new(AddressBook::new(Arc::new(NullClock::default())));
        fixture_with_book(config, headers, book)
    }

    fn fixture_with_book(
        config: ChainServiceConfig,
        headers: NullHeaderStore,
        book: Arc<AddressBook>,
    ) -> Fixture {
        let clock = Arc::new(NullClock::default());
        let headers = Arc::new(headers);
        let sync = Arc::new(RecordingSync::default());
        let (dialer, links) = NullDialer::new();
        let service = ChainService::new(
            config,
            ChainServiceDeps {
                header_store: headers.clone(),
                address_source: book,
                sync_manager: sync.clone(),
                dialer: Arc::new(dialer),
                ban_store: Some(Arc::new(NullBanStore::new())),
                clock,
            },
        )
        .unwrap();
        Fixture {
            service,
            headers,
            sync,
            links,
        }
    }

    fn persistent(addr: &str) -> ChainServiceConfig {
        ChainServiceConfig {
            connect_peers: vec![addr.to_string()],
            dns_seeds: vec![],
            ..ChainServiceConfig::default()
        }
    }

    #[test]
    fn best_block_is_capped_by_the_filter_tip() {
        let headers = NullHeaderStore::with_chain(5);
        headers.extend(3);
        let f = fixture(persistent("8.8.8.8:8333"), headers);
        let best = f.service.best_block().unwrap();
        assert_eq!(best.height, 5);
        assert_eq!(best.hash, f.service.get_block_hash(5).unwrap());
        assert_eq!(f.service.get_block_height(&best.hash).unwrap(), 5);
        assert_eq!(f.headers.block_height(), 8);
    }

    #[test]
    fn unknown_hash_propagates_store_error() {
        let f = fixture(persistent("8.8.8.8:8333"), NullHeaderStore::with_chain(2));
        let err = f.service.get_block_header(&BlockHash::hash(b"nope")).unwrap_err();
        assert!(matches!(err, NodeError::Store(_)));
    }

    #[test]
    fn identity() {
        let f = fixture(persistent("8.8.8.8:8333"), NullHeaderStore::new());
        assert_eq!(f.service.backend_name(), "neutrino");
        assert_eq!(f.service.net_totals(), (0, 0));
        assert!(!f.service.is_current());
        f.sync.current.store(true, Ordering::SeqCst);
        assert!(f.service.is_current());
    }

    #[test]
    fn adjusted_time_follows_the_peer_median() {
        let f = fixture(persistent("8.8.8.8:8333"), NullHeaderStore::new());
        let now = f.service.ctx.clock.now();
        assert_eq!(f.service.adjusted_time(), now);
        for i in 0..5 {
            f.service
                .ctx
                .time_source
                .add_sample(&format!("9.9.9.{i}"), now.minus_secs(40), now);
        }
        assert_eq!(f.service.time_offset_secs(), -40);
        assert_eq!(f.service.adjusted_time(), now.minus_secs(40));
    }

    #[tokio::test]
    async fn rollback_emits_one_event_per_block() {
        let f = fixture(persistent("8.8.8.8:8333"), NullHeaderStore::with_chain(6));
        let mut events = f.service.subscribe_blocks();
        let top = f.service.get_block_hash(6).unwrap();
        let tip = f.service.rollback_to_height(4).await.unwrap();
        assert_eq!(tip.height, 4);
        assert_eq!(f.headers.block_height(), 4);
        assert!(f.headers.filter_height() <= f.headers.block_height());

        match events.try_recv().unwrap() {
            BlockEvent::Disconnected { stamp, new_tip } => {
                assert_eq!(stamp.height, 6);
                assert_eq!(stamp.hash, top);
                assert_eq!(new_tip.height, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            BlockEvent::Disconnected { new_tip, .. } if new_tip.height == 4
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let mut f = fixture(persistent("8.8.8.8:8333"), NullHeaderStore::with_chain(1));
        f.service.start().unwrap();
        f.service.start().unwrap();
        let dialed = f.links.recv().await.unwrap();
        assert_eq!(dialed.addr, "8.8.8.8:8333".parse::<SocketAddr>().unwrap());

        f.service.stop().await;
        f.service.stop().await;
        assert!(matches!(f.service.start(), Err(NodeError::ShuttingDown)));
        assert!(matches!(
            f.service.send_transaction(peer_tx()).await,
            Err(NodeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn persistent_peer_handshake_registers_and_fetches_filter() {
        let mut f = fixture(persistent("8.8.4.4:8333"), NullHeaderStore::with_chain(3));
        f.service.start().unwrap();
        let mut dialed = f.links.recv().await.unwrap();
        handshake(&mut dialed.remote, peer_version(full_services(), 3))
            .await
            .unwrap();
        f.service.first_peer_connected().await.unwrap();
        assert_eq!(f.service.connected_count().await.unwrap(), 1);
        let peers = wait_for_verack(&f.service).await;
        assert!(peers[0].persistent);
        assert_eq!(*f.sync.new_peers.lock(), vec![PeerId::new(peers[0].id)]);

        // Serve the filter request for block 2.
        let hash = f.service.get_block_hash(2).unwrap();
        let remote = &mut dialed.remote;
        let serve = async {
            loop {
                match remote.sent.recv().await {
                    Some(Message::GetCFilters(req)) => {
                        assert_eq!(req.start_height, 2);
                        remote
                            .deliver
                            .send(Message::CFilter(cfnode_messages::CFilterMessage {
                                block_hash: req.stop_hash,
                                filter: GcsFilter::from_parts(0, Vec::new()),
                            }))
                            .await
                            .unwrap();
                        return;
                    }
                    Some(_) => continue,
                    None => panic!("link closed"),
                }
            }
        };
        let (filter, ()) = tokio::join!(f.service.get_cfilter(&hash), serve);
        assert_eq!(filter.unwrap().unwrap().n(), 0);
        assert_eq!(f.service.metrics().filter_fetches.get(), 1);

        // Cached: no second request.
        assert!(f.service.get_cfilter(&hash).await.unwrap().is_some());
        assert_eq!(f.service.metrics().filter_fetches.get(), 1);

        f.service.stop().await;
    }

    #[tokio::test]
    async fn filter_beyond_filter_tip_is_not_available() {
        let headers = NullHeaderStore::with_chain(2);
        let ahead = headers.extend(1)[0].block_hash();
        let f = fixture(persistent("8.8.8.8:8333"), headers);
        assert_eq!(f.service.get_cfilter(&ahead).await.unwrap(), None);
    }

    #[tokio::test]
    async fn mode_follows_peer_count_and_sync_peer() {
        let config = ChainServiceConfig {
            target_outbound: 8,
            relaxed_enough_peers: 4,
            dns_seeds: vec![],
            ..ChainServiceConfig::default()
        };
        let f = fixture(config, NullHeaderStore::new());
        let mut sessions = Vec::new();
        let registry = f.service.ctx.registry.clone();
        f.service.start().unwrap();
        assert_eq!(f.service.evaluate_search_mode().await.unwrap(), SearchMode::Fast);

        // Register five handshaken sessions directly.
        for i in 0..5u8 {
            let addr = format!("{}.1.2.3:8333", 30 + i).parse().unwrap();
            let (link, remote) = cfnode_network::memory_link(addr, 8);
            let session =
                PeerSession::new(f.service.ctx.clone(), link.driver, link.addr, false, None);
            registry.add_peer(session.clone()).await.unwrap();
            sessions.push((session, remote));
        }
        assert_eq!(f.service.connected_count().await.unwrap(), 5);
        assert_eq!(f.service.evaluate_search_mode().await.unwrap(), SearchMode::Fast);

        *f.sync.sync_peer.lock() = Some(sessions[0].0.id());
        assert_eq!(f.service.evaluate_search_mode().await.unwrap(), SearchMode::Relaxed);
        assert_eq!(f.service.metrics().relaxed_mode.get(), 1);

        *f.sync.sync_peer.lock() = None;
        assert_eq!(f.service.evaluate_search_mode().await.unwrap(), SearchMode::Fast);
        assert_eq!(f.service.search_mode(), SearchMode::Fast);
        f.service.stop().await;
    }

    async fn wait_for_verack(service: &ChainService) -> Vec<PeerDescriptor> {
        for _ in 0..100 {
            let peers = service.peers().await.unwrap();
            if !peers.is_empty() && peers.iter().all(|p| p.verack_received) {
                return peers;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peers never completed the handshake");
    }

    fn peer_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
        }
    }

    /// Supervisor, registry and connection handling without the rest of
    /// the service.
    struct Wiring {
        h: Harness,
        supervisor: ConnectionSupervisor,
        connected: mpsc::Receiver<Connected>,
        links: mpsc::UnboundedReceiver<DialedLink>,
        tasks: Arc<TaskTracker>,
    }

    fn wiring() -> Wiring {
        let mut h = harness(ChainServiceConfig::default());
        let (dialer, links) = NullDialer::new();
        let (connected_tx, connected) = mpsc::channel(8);
        let tasks = Arc::new(TaskTracker::new());
        let supervisor = ConnectionSupervisor::new(
            SupervisorConfig {
                target_outbound: 0,
                retry_interval: Duration::from_millis(20),
            },
            Arc::new(dialer),
            None,
            connected_tx,
            h.ctx.shutdown.clone(),
            tasks.clone(),
        );
        let (_, closed) = mpsc::channel(1);
        let registry_rx = std::mem::replace(&mut h.registry_rx, closed);
        let (first_peer, _) = oneshot::channel();
        tokio::spawn(PeerRegistry::new(h.ctx.clone(), supervisor.clone(), registry_rx, first_peer).run());
        Wiring {
            h,
            supervisor,
            connected,
            links,
            tasks,
        }
    }

    impl Wiring {
        async fn dial(&mut self, addr: &str, permanent: bool) -> (ConnReqId, Connected, DialedLink) {
            let id = self.supervisor.connect(addr.parse().unwrap(), permanent);
            let conn = tokio::time::timeout(WAIT, self.connected.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(conn.req.id, id);
            let dialed = self.links.recv().await.unwrap();
            (id, conn, dialed)
        }

        async fn accept(&self, conn: Connected) {
            accept_connection(&self.h.ctx, &self.supervisor, &self.tasks, conn).await;
        }

        async fn redial_of(&mut self, id: ConnReqId) -> Connected {
            let conn = tokio::time::timeout(WAIT, self.connected.recv())
                .await
                .expect("request redialed")
                .unwrap();
            assert_eq!(conn.req.id, id);
            conn
        }
    }

    #[tokio::test]
    async fn second_connection_to_a_live_address_keeps_only_permanent_requests() {
        let mut w = wiring();
        let addr = "8.5.1.1:8333";
        let (_, conn, mut live) = w.dial(addr, true).await;
        w.accept(conn).await;
        handshake(&mut live.remote, peer_version(full_services(), 1))
            .await
            .unwrap();
        let mut registered = false;
        for _ in 0..100 {
            if w.h.ctx.registry.peer_by_addr(addr.parse().unwrap()).await.unwrap().is_some() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registered);

        let (once, conn, extra) = w.dial(addr, false).await;
        w.accept(conn).await;
        tokio::time::timeout(WAIT, extra.remote.closed.fired()).await.unwrap();
        assert!(w.supervisor.request(once).is_none());

        let (kept, conn, duplicate) = w.dial(addr, true).await;
        w.accept(conn).await;
        tokio::time::timeout(WAIT, duplicate.remote.closed.fired()).await.unwrap();
        assert!(w.supervisor.request(kept).is_some());
        let again = w.redial_of(kept).await;
        assert_eq!(again.req.retry_count, 1);
        assert_eq!(w.h.ctx.registry.connected_count().await.unwrap(), 1);

        w.h.shutdown.shutdown();
    }

    #[tokio::test]
    async fn banned_address_is_refused_before_a_session_starts() {
        let mut w = wiring();
        let addr = "8.5.2.1:8333";
        let threshold = w.h.ctx.config.ban_threshold;
        assert!(w.h.ctx.ban_ledger.add_ban_score(addr, threshold, 0, "test ban"));

        let (id, conn, mut dialed) = w.dial(addr, true).await;
        w.accept(conn).await;
        tokio::time::timeout(WAIT, dialed.remote.closed.fired()).await.unwrap();
        // No session ever wrote a version message.
        assert!(dialed.remote.sent.recv().await.is_none());
        assert_eq!(w.h.ctx.registry.connected_count().await.unwrap(), 0);

        assert!(w.supervisor.request(id).is_some());
        let again = w.redial_of(id).await;
        assert_eq!(again.req.retry_count, 1);

        w.h.shutdown.shutdown();
    }

    #[tokio::test]
    async fn simnet_never_dials_discovered_addresses() {
        for (network, dials) in [(NetworkId::Sim, false), (NetworkId::Reg, true)] {
            let clock = NullClock::default();
            let book = Arc::new(AddressBook::new(Arc::new(NullClock::default())));
            let known: SocketAddr = ([8, 9, 1, 1], network.default_port()).into();
            let source: SocketAddr = ([8, 8, 8, 8], network.default_port()).into();
            book.add_addresses(
                &[NetAddress::from_socket(known, ServiceFlags::NETWORK, clock.now())],
                &NetAddress::from_socket(source, ServiceFlags::NETWORK, clock.now()),
            );
            let config = ChainServiceConfig {
                network,
                dns_seeds: vec![],
                ..ChainServiceConfig::default()
            };
            let mut f = fixture_with_book(config, NullHeaderStore::new(), book);
            f.service.start().unwrap();

            let dialed = tokio::time::timeout(Duration::from_millis(500), f.links.recv()).await;
            if dials {
                assert_eq!(dialed.unwrap().unwrap().addr, known);
            } else {
                assert!(dialed.is_err());
            }
            f.service.stop().await;
        }
    }
}
