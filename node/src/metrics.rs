//! Prometheus metrics for the chain service.
//!
//! [`NodeMetrics`] owns a dedicated [`Registry`]; [`NodeMetrics::encode`]
//! renders it in the Prometheus text exposition format.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntGauge, Opts, Registry, TextEncoder,
};

/// Central collection of chain-service metrics.
pub struct NodeMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Bytes read from peers.
    pub bytes_received: IntCounter,
    /// Bytes queued to peers.
    pub bytes_sent: IntCounter,
    /// Hosts moved into the banned state.
    pub bans: IntCounter,
    /// Filters retrieved from peers (cache misses that resolved).
    pub filter_fetches: IntCounter,
    /// Blocks retrieved from peers.
    pub block_fetches: IntCounter,
    /// Blocks whose filter matched the watch list and whose body confirmed it.
    pub filter_matches: IntCounter,
    /// Transactions announced for the first time.
    pub txs_broadcast: IntCounter,
    /// Re-announcements of unconfirmed transactions.
    pub txs_rebroadcast: IntCounter,
    /// Raw messages dropped because a subscriber queue was full.
    pub fanout_dropped: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Peers currently registered.
    pub peer_count: IntGauge,
    /// Query requests awaiting a response.
    pub active_queries: IntGauge,
    /// 1 while address search runs in relaxed mode.
    pub relaxed_mode: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    register_int_counter_with_registry!(Opts::new(name, help), registry)
        .expect("failed to register counter")
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    register_int_gauge_with_registry!(Opts::new(name, help), registry)
        .expect("failed to register gauge")
}

impl NodeMetrics {
    /// Create a fresh set of metrics, all registered under a new [`Registry`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let bytes_received = counter(
            &registry,
            "cfnode_bytes_received_total",
            "Total bytes read from peers",
        );
        let bytes_sent = counter(
            &registry,
            "cfnode_bytes_sent_total",
            "Total bytes queued to peers",
        );
        let bans = counter(&registry, "cfnode_bans_total", "Total hosts banned");
        let filter_fetches = counter(
            &registry,
            "cfnode_filter_fetches_total",
            "Total compact filters fetched from peers",
        );
        let block_fetches = counter(
            &registry,
            "cfnode_block_fetches_total",
            "Total blocks fetched from peers",
        );
        let filter_matches = counter(
            &registry,
            "cfnode_filter_matches_total",
            "Total scanned blocks with relevant transactions",
        );
        let txs_broadcast = counter(
            &registry,
            "cfnode_txs_broadcast_total",
            "Total transactions broadcast",
        );
        let txs_rebroadcast = counter(
            &registry,
            "cfnode_txs_rebroadcast_total",
            "Total transaction re-announcements",
        );
        let fanout_dropped = counter(
            &registry,
            "cfnode_fanout_dropped_total",
            "Total raw messages dropped on full subscriber queues",
        );

        let peer_count = gauge(&registry, "cfnode_peer_count", "Currently registered peers");
        let active_queries = gauge(
            &registry,
            "cfnode_active_queries",
            "Query requests awaiting a response",
        );
        let relaxed_mode = gauge(
            &registry,
            "cfnode_relaxed_mode",
            "1 while address search runs in relaxed mode",
        );

        Self {
            registry,
            bytes_received,
            bytes_sent,
            bans,
            filter_fetches,
            block_fetches,
            filter_matches,
            txs_broadcast,
            txs_rebroadcast,
            fanout_dropped,
            peer_count,
            active_queries,
            relaxed_mode,
        }
    }

    /// Cumulative `(received, sent)` byte totals.
    pub fn net_totals(&self) -> (u64, u64) {
        (self.bytes_received.get(), self.bytes_sent.get())
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
