//! LMDB storage backend.
//!
//! Implements the persistent storage traits from `cfnode-store` using the
//! `heed` LMDB bindings. Each logical store maps to one named database within
//! a single environment.

pub mod ban;
pub mod environment;
pub mod error;

pub use ban::LmdbBanStore;
pub use environment::{LmdbEnvironment, DEFAULT_MAP_SIZE};
pub use error::LmdbError;
