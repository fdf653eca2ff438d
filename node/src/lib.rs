//! Compact-filter light node chain service.
//!
//! The chain service is the coordinator that:
//! - Maintains outbound peer connections (fast/relaxed address search,
//!   network-group diversity, persistent peers with fixed-interval retry)
//! - Runs one session task per peer and a single registry actor that owns
//!   the live peer set
//! - Scores and bans misbehaving peers
//! - Dispatches query batches to peers and fetches filters and blocks
//! - Scans compact filters for wallet-relevant blocks
//! - Broadcasts transactions and rebroadcasts them on new blocks

pub mod broadcaster;
pub mod candidates;
pub mod chain_service;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod filter_scan;
pub mod logging;
pub mod metrics;
pub mod pending_filters;
pub mod query;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod supervisor;
pub mod sync_manager;

#[cfg(test)]
pub(crate) mod test_support;

pub use broadcaster::{Broadcaster, PeerAnnouncer, TxAnnouncer};
pub use candidates::OutboundCandidates;
pub use chain_service::{open_lmdb_ban_store, ChainService, ChainServiceDeps};
pub use config::ChainServiceConfig;
pub use context::ServiceContext;
pub use error::NodeError;
pub use events::BlockEvent;
pub use filter_scan::{
    filter_blocks, ChainSource, FilterBlocksRequest, FilterBlocksResponse, PollPolicy,
};
pub use logging::{init_logging, LogFormat};
pub use metrics::NodeMetrics;
pub use pending_filters::{PendingFilter, PendingFilters};
pub use query::{BatchReport, PeerSelection, QueryDescriptor, QueryDispatcher, QueryOptions};
pub use registry::{PeerRegistry, RegistryCommand, RegistryHandle, RegistrySnapshot};
pub use session::{PeerDescriptor, PeerSession, SessionState};
pub use shutdown::{ShutdownController, TaskTracker};
pub use supervisor::{
    CandidateSource, ConnReq, ConnReqId, ConnState, Connected, ConnectionSupervisor,
    SupervisorConfig,
};
pub use sync_manager::SyncManager;
