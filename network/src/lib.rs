//! P2P networking layer for the compact-filter node.
//!
//! Holds everything about peers that does not need the chain service itself:
//! the link/driver abstraction and TCP transport, the ban ledger, the address
//! book and selection policy, inventory bookkeeping (known transactions and
//! waiters), raw-message fan-out, rebroadcast tracking and clock offsets.

pub mod address_book;
pub mod ban;
pub mod clock_sync;
pub mod error;
pub mod fanout;
pub mod inv_waiters;
pub mod known_txns;
pub mod peer_id;
pub mod rebroadcast;
pub mod selection;
pub mod signal;
pub mod tcp;
pub mod transport;

pub use address_book::{AddressBook, AddressSource, KnownAddress};
pub use ban::{BanConfig, BanLedger};
pub use clock_sync::MedianTime;
pub use error::NetworkError;
pub use fanout::{PeerMessage, SubscriberSet};
pub use inv_waiters::{InvSighting, InvWaiters};
pub use known_txns::KnownTxns;
pub use peer_id::{PeerId, PeerIdAllocator};
pub use rebroadcast::RebroadcastTracker;
pub use selection::{CandidateFilter, ModeFlag, ModePolicy, SearchMode};
pub use signal::{signal_pair, Signal, Trigger};
pub use tcp::TcpDialer;
pub use transport::{memory_link, ChannelDriver, Dialer, PeerLink, ProtocolDriver, RemoteEnd};
