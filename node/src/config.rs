//! Chain service configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use cfnode_network::{BanConfig, ModePolicy};
use cfnode_types::{NetworkId, ServiceFlags};

use crate::filter_scan::PollPolicy;
use crate::NodeError;

pub const DEFAULT_MAX_PEERS: usize = 125;
pub const DEFAULT_TARGET_OUTBOUND: usize = 12;
pub const DEFAULT_RELAXED_ENOUGH_PEERS: usize = 4;
pub const DEFAULT_CONNECTION_RETRY_SECS: u64 = 3;
pub const DEFAULT_MODE_EVAL_SECS: u64 = 30;
pub const DEFAULT_FILTER_CACHE_SIZE: usize = 4_096;
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 64;
pub const DEFAULT_FILTER_POLL_ATTEMPTS: u32 = 50;
pub const DEFAULT_FILTER_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_KNOWN_TXN_WINDOW_SECS: u64 = 20 * 60;
pub const DEFAULT_REBROADCAST_SECS: u64 = 5 * 60;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_QUERY_RETRIES: u8 = 2;
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_USER_AGENT_NAME: &str = "cfnode";
pub const DEFAULT_USER_AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for a [`ChainService`](crate::ChainService).
///
/// Loaded from a TOML file via [`ChainServiceConfig::from_toml_file`] or built
/// programmatically (e.g. for tests). Every field has a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainServiceConfig {
    #[serde(default = "default_network")]
    pub network: NetworkId,

    /// Directory for persisted ban records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Connect only to these peers (`host:port`). Disables opportunistic dialing.
    #[serde(default)]
    pub connect_peers: Vec<String>,

    /// Persistent peers dialed in addition to opportunistic ones.
    #[serde(default)]
    pub add_peers: Vec<String>,

    /// DNS seeds resolved at start to populate the address book.
    #[serde(default)]
    pub dns_seeds: Vec<String>,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Outbound connections the supervisor keeps open.
    #[serde(default = "default_target_outbound")]
    pub target_outbound: usize,

    /// Peer count at which relaxed address search becomes possible.
    #[serde(default = "default_relaxed_enough_peers")]
    pub relaxed_enough_peers: usize,

    #[serde(default = "default_connection_retry_secs")]
    pub connection_retry_interval_secs: u64,

    /// How often the address search mode is re-evaluated.
    #[serde(default = "default_mode_eval_secs")]
    pub mode_eval_interval_secs: u64,

    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,

    #[serde(default)]
    pub ban_warn_threshold: u32,

    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    #[serde(default)]
    pub disable_banning: bool,

    /// Hosts that are never banned.
    #[serde(default)]
    pub whitelist: Vec<IpAddr>,

    /// Service bits a peer must advertise to be kept.
    #[serde(default = "default_required_services")]
    pub required_services: ServiceFlags,

    #[serde(default = "default_user_agent_name")]
    pub user_agent_name: String,

    #[serde(default = "default_user_agent_version")]
    pub user_agent_version: String,

    /// Filters kept in the LRU cache.
    #[serde(default = "default_filter_cache_size")]
    pub filter_cache_size: usize,

    /// Blocks kept in the LRU cache.
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: usize,

    #[serde(default = "default_filter_poll_attempts")]
    pub filter_poll_attempts: u32,

    #[serde(default = "default_filter_poll_interval_ms")]
    pub filter_poll_interval_ms: u64,

    #[serde(default = "default_known_txn_window_secs")]
    pub known_txn_window_secs: u64,

    #[serde(default = "default_rebroadcast_secs")]
    pub rebroadcast_interval_secs: u64,

    /// Per-request wait before a query is resent to the next peer.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_query_retries")]
    pub query_retries: u8,

    /// Capacity of each raw-message subscriber queue.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> NetworkId {
    NetworkId::Main
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./cfnode_data")
}

fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

fn default_target_outbound() -> usize {
    DEFAULT_TARGET_OUTBOUND
}

fn default_relaxed_enough_peers() -> usize {
    DEFAULT_RELAXED_ENOUGH_PEERS
}

fn default_connection_retry_secs() -> u64 {
    DEFAULT_CONNECTION_RETRY_SECS
}

fn default_mode_eval_secs() -> u64 {
    DEFAULT_MODE_EVAL_SECS
}

fn default_ban_threshold() -> u32 {
    cfnode_network::ban::DEFAULT_BAN_THRESHOLD
}

fn default_ban_duration_secs() -> u64 {
    cfnode_network::ban::DEFAULT_BAN_DURATION_SECS
}

fn default_required_services() -> ServiceFlags {
    ServiceFlags::NETWORK | ServiceFlags::WITNESS | ServiceFlags::CF
}

fn default_user_agent_name() -> String {
    DEFAULT_USER_AGENT_NAME.to_string()
}

fn default_user_agent_version() -> String {
    DEFAULT_USER_AGENT_VERSION.to_string()
}

fn default_filter_cache_size() -> usize {
    DEFAULT_FILTER_CACHE_SIZE
}

fn default_block_cache_size() -> usize {
    DEFAULT_BLOCK_CACHE_SIZE
}

fn default_filter_poll_attempts() -> u32 {
    DEFAULT_FILTER_POLL_ATTEMPTS
}

fn default_filter_poll_interval_ms() -> u64 {
    DEFAULT_FILTER_POLL_INTERVAL_MS
}

fn default_known_txn_window_secs() -> u64 {
    DEFAULT_KNOWN_TXN_WINDOW_SECS
}

fn default_rebroadcast_secs() -> u64 {
    DEFAULT_REBROADCAST_SECS
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

fn default_query_retries() -> u8 {
    DEFAULT_QUERY_RETRIES
}

fn default_subscriber_queue_capacity() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE_CAPACITY
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl ChainServiceConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Reject unusable settings and clamp the outbound target to `max_peers`.
    pub fn validate(mut self) -> Result<Self, NodeError> {
        if self.max_peers == 0 {
            return Err(NodeError::Config("max_peers must be at least 1".into()));
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(NodeError::Config(
                "subscriber_queue_capacity must be at least 1".into(),
            ));
        }
        if self.target_outbound > self.max_peers {
            tracing::warn!(
                target_outbound = self.target_outbound,
                max_peers = self.max_peers,
                "target_outbound exceeds max_peers, clamping"
            );
            self.target_outbound = self.max_peers;
        }
        Ok(self)
    }

    pub fn ban_config(&self) -> BanConfig {
        BanConfig {
            threshold: self.ban_threshold,
            warn_threshold: self.ban_warn_threshold,
            duration_secs: self.ban_duration_secs,
            disabled: self.disable_banning,
            whitelist: self.whitelist.clone(),
        }
    }

    pub fn mode_policy(&self) -> ModePolicy {
        ModePolicy {
            target_outbound: self.target_outbound,
            relaxed_enough_peers: self.relaxed_enough_peers,
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            attempts: self.filter_poll_attempts.max(1),
            interval: Duration::from_millis(self.filter_poll_interval_ms),
        }
    }

    pub fn user_agent(&self) -> String {
        format!("/{}:{}/", self.user_agent_name, self.user_agent_version)
    }

    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_secs(self.connection_retry_interval_secs)
    }

    pub fn mode_eval_interval(&self) -> Duration {
        Duration::from_secs(self.mode_eval_interval_secs.max(1))
    }

    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_secs(self.rebroadcast_interval_secs)
    }

    pub fn known_txn_window(&self) -> Duration {
        Duration::from_secs(self.known_txn_window_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for ChainServiceConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: default_data_dir(),
            connect_peers: Vec::new(),
            add_peers: Vec::new(),
            dns_seeds: Vec::new(),
            max_peers: default_max_peers(),
            target_outbound: default_target_outbound(),
            relaxed_enough_peers: default_relaxed_enough_peers(),
            connection_retry_interval_secs: default_connection_retry_secs(),
            mode_eval_interval_secs: default_mode_eval_secs(),
            ban_threshold: default_ban_threshold(),
            ban_warn_threshold: 0,
            ban_duration_secs: default_ban_duration_secs(),
            disable_banning: false,
            whitelist: Vec::new(),
            required_services: default_required_services(),
            user_agent_name: default_user_agent_name(),
            user_agent_version: default_user_agent_version(),
            filter_cache_size: default_filter_cache_size(),
            block_cache_size: default_block_cache_size(),
            filter_poll_attempts: default_filter_poll_attempts(),
            filter_poll_interval_ms: default_filter_poll_interval_ms(),
            known_txn_window_secs: default_known_txn_window_secs(),
            rebroadcast_interval_secs: default_rebroadcast_secs(),
            query_timeout_ms: default_query_timeout_ms(),
            query_retries: default_query_retries(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}
