//! Block-header and filter-header store contract.

use cfnode_types::{BlockHash, BlockHeader, BlockStamp, FilterHash};

use crate::StoreError;

/// Opaque header store shared by the sync orchestrator and the chain service.
///
/// Heights are zero-based. Implementations must keep the filter-header chain
/// no longer than the block-header chain: appending a filter header for a
/// height with no block header fails with [`StoreError::Corruption`].
pub trait HeaderStore: Send + Sync {
    /// Tip of the block-header chain and its height.
    fn chain_tip(&self) -> Result<(BlockHeader, u32), StoreError>;

    /// Tip of the filter-header chain and its height.
    fn filter_tip(&self) -> Result<(FilterHash, u32), StoreError>;

    fn header_by_height(&self, height: u32) -> Result<BlockHeader, StoreError>;

    /// Header and height for a block hash.
    fn header_by_hash(&self, hash: &BlockHash) -> Result<(BlockHeader, u32), StoreError>;

    fn filter_header_by_height(&self, height: u32) -> Result<FilterHash, StoreError>;

    /// Append headers that extend the current block tip.
    fn append_headers(&self, headers: &[BlockHeader]) -> Result<(), StoreError>;

    /// Append filter headers that extend the current filter tip.
    fn append_filter_headers(&self, headers: &[FilterHash]) -> Result<(), StoreError>;

    /// Atomically remove the block-tip header (and its filter header, if the
    /// filter chain reaches it). Returns the new block tip.
    fn rollback_last_block(&self) -> Result<BlockStamp, StoreError>;
}
