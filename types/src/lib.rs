//! Fundamental types for the compact-filter light node.
//!
//! This crate defines the types shared across every other crate in the workspace:
//! hashes, timestamps, network identifiers, service bits, peer addresses, the
//! block/transaction model and the compact (GCS) block filter.

pub mod address;
pub mod amount;
pub mod block;
pub mod error;
pub mod gcs;
pub mod hash;
pub mod network;
pub mod services;
pub mod time;
pub mod tx;

pub use address::NetAddress;
pub use amount::{is_valid_amount, MAX_MONEY};
pub use block::{Block, BlockHeader, BlockMeta, BlockStamp};
pub use error::TypesError;
pub use gcs::GcsFilter;
pub use hash::{sha256d, BlockHash, FilterHash, Txid};
pub use network::NetworkId;
pub use services::ServiceFlags;
pub use time::{Clock, SystemClock, Timestamp};
pub use tx::{OutPoint, Script, Transaction, TxIn, TxOut};
