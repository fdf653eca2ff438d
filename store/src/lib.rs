//! Abstract storage traits for the compact-filter node.
//!
//! The chain service depends only on these traits. Header storage internals
//! are owned by the embedding application; the ban ledger can be persisted by
//! any [`BanStore`] backend (LMDB in `cfnode-store-lmdb`, in-memory in tests).

pub mod ban;
pub mod error;
pub mod header;

pub use ban::{BanRecord, BanStore};
pub use error::StoreError;
pub use header::HeaderStore;
