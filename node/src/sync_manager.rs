//! Contract with the header/filter-header sync orchestrator.

use std::sync::Arc;

use cfnode_messages::{HeadersMessage, InvMessage};
use cfnode_network::PeerId;

use crate::session::PeerSession;

/// Elects a sync peer and drives header and filter-header catch-up.
///
/// Calls arrive from peer tasks and the registry actor; implementations must
/// not block.
pub trait SyncManager: Send + Sync {
    /// A peer completed version negotiation and is a sync candidate.
    fn new_peer(&self, peer: &Arc<PeerSession>);

    /// A previously announced peer went away.
    fn done_peer(&self, peer: &Arc<PeerSession>);

    fn queue_inv(&self, inv: &InvMessage, peer: &Arc<PeerSession>);

    fn queue_headers(&self, headers: &HeadersMessage, peer: &Arc<PeerSession>);

    /// The current sync peer, if one is elected.
    fn sync_peer(&self) -> Option<PeerId>;

    /// Whether headers and filter headers have caught up with the network.
    fn is_current(&self) -> bool;
}
