//! Block headers, full blocks and chain-tip stamps.

use serde::{Deserialize, Serialize};

use crate::{BlockHash, Timestamp, Transaction};

/// An 80-byte block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn block_hash(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(80);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.prev_block.as_bytes());
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        BlockHash::hash(&buf)
    }

    pub fn time(&self) -> Timestamp {
        Timestamp::new(u64::from(self.timestamp))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// A chain tip: height, hash and header time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStamp {
    pub height: u32,
    pub hash: BlockHash,
    pub timestamp: Timestamp,
}

/// Height and hash of a block to scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockMeta {
    pub height: u32,
    pub hash: BlockHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_hash_covers_nonce() {
        let mut header = BlockHeader {
            version: 1,
            prev_block: BlockHash::ZERO,
            merkle_root: [0; 32],
            timestamp: 1_600_000_000,
            bits: 0x1d00ffff,
            nonce: 0,
        };
        let before = header.block_hash();
        header.nonce = 1;
        assert_ne!(before, header.block_hash());
        assert_eq!(header.time().as_secs(), 1_600_000_000);
    }
}
