//! Chain notifications published by the chain service.

use cfnode_types::BlockStamp;

/// Capacity of the block-event broadcast channel.
pub const BLOCK_EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockEvent {
    /// A new best block.
    Connected(BlockStamp),
    /// `stamp` was removed; `new_tip` is the tip after removal.
    Disconnected { stamp: BlockStamp, new_tip: BlockStamp },
}

impl BlockEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, BlockEvent::Connected(_))
    }
}
