//! Nullable infrastructure for deterministic testing.
//!
//! The chain service reaches the clock, header storage, ban persistence and
//! the network through traits. This crate provides test-friendly
//! implementations that:
//! - Return deterministic values
//! - Can be controlled programmatically
//! - Never touch the filesystem or network
//!
//! Usage: swap real implementations for nullables in tests.

pub mod clock;
pub mod network;
pub mod store;

pub use clock::NullClock;
pub use network::{handshake, peer_version, DialedLink, NullDialer};
pub use store::{next_header, NullBanStore, NullHeaderStore};
