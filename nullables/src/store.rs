//! Nullable stores: thread-safe in-memory header and ban storage for testing.

use cfnode_store::{BanRecord, BanStore, HeaderStore, StoreError};
use cfnode_types::{sha256d, BlockHash, BlockHeader, BlockStamp, FilterHash, GcsFilter};
use std::collections::HashMap;
use std::sync::Mutex;

const GENESIS_TIME: u32 = 1_600_000_000;
const BLOCK_SPACING: u32 = 600;

/// A synthetic header extending `prev`, which sits at `height - 1`.
pub fn next_header(prev: &BlockHeader, height: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: prev.block_hash(),
        merkle_root: sha256d(&height.to_le_bytes()),
        timestamp: GENESIS_TIME + height * BLOCK_SPACING,
        bits: 0x207f_ffff,
        nonce: height,
    }
}

fn genesis() -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: BlockHash::ZERO,
        merkle_root: [0u8; 32],
        timestamp: GENESIS_TIME,
        bits: 0x207f_ffff,
        nonce: 0,
    }
}

struct Chains {
    headers: Vec<BlockHeader>,
    filter_headers: Vec<FilterHash>,
    heights: HashMap<BlockHash, u32>,
}

/// An in-memory header store holding a genesis header and its filter header.
///
/// Enforces the same invariant as a real store: the filter-header chain
/// never runs past the block-header chain.
pub struct NullHeaderStore {
    chains: Mutex<Chains>,
}

impl NullHeaderStore {
    pub fn new() -> Self {
        let genesis = genesis();
        let empty = GcsFilter::from_parts(0, Vec::new());
        let mut heights = HashMap::new();
        heights.insert(genesis.block_hash(), 0);
        Self {
            chains: Mutex::new(Chains {
                headers: vec![genesis],
                filter_headers: vec![FilterHash::chain(&empty.to_bytes(), &FilterHash::ZERO)],
                heights,
            }),
        }
    }

    /// A store whose block and filter chains both reach `height`, with
    /// empty filters above genesis.
    pub fn with_chain(height: u32) -> Self {
        let store = Self::new();
        store.extend(height);
        let empty = GcsFilter::from_parts(0, Vec::new());
        store.append_filters(&vec![empty; height as usize]);
        store
    }

    /// Append `count` synthetic headers and return them.
    pub fn extend(&self, count: u32) -> Vec<BlockHeader> {
        let mut chains = self.chains.lock().unwrap();
        let mut added = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let height = chains.headers.len() as u32;
            let header = next_header(&chains.headers[chains.headers.len() - 1], height);
            chains.heights.insert(header.block_hash(), height);
            chains.headers.push(header);
            added.push(header);
        }
        added
    }

    /// Append filter headers committing to `filters`, in height order.
    pub fn append_filters(&self, filters: &[GcsFilter]) -> Vec<FilterHash> {
        let mut chains = self.chains.lock().unwrap();
        let mut added = Vec::with_capacity(filters.len());
        for filter in filters {
            if chains.filter_headers.len() >= chains.headers.len() {
                break;
            }
            let prev = chains.filter_headers[chains.filter_headers.len() - 1];
            let header = FilterHash::chain(&filter.to_bytes(), &prev);
            chains.filter_headers.push(header);
            added.push(header);
        }
        added
    }

    pub fn block_height(&self) -> u32 {
        self.chains.lock().unwrap().headers.len() as u32 - 1
    }

    pub fn filter_height(&self) -> u32 {
        self.chains.lock().unwrap().filter_headers.len() as u32 - 1
    }
}

impl Default for NullHeaderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderStore for NullHeaderStore {
    fn chain_tip(&self) -> Result<(BlockHeader, u32), StoreError> {
        let chains = self.chains.lock().unwrap();
        let height = chains.headers.len() - 1;
        Ok((chains.headers[height], height as u32))
    }

    fn filter_tip(&self) -> Result<(FilterHash, u32), StoreError> {
        let chains = self.chains.lock().unwrap();
        let height = chains.filter_headers.len() - 1;
        Ok((chains.filter_headers[height], height as u32))
    }

    fn header_by_height(&self, height: u32) -> Result<BlockHeader, StoreError> {
        self.chains
            .lock()
            .unwrap()
            .headers
            .get(height as usize)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("header at height {height}")))
    }

    fn header_by_hash(&self, hash: &BlockHash) -> Result<(BlockHeader, u32), StoreError> {
        let chains = self.chains.lock().unwrap();
        let height = *chains
            .heights
            .get(hash)
            .ok_or_else(|| StoreError::NotFound(format!("header {hash}")))?;
        Ok((chains.headers[height as usize], height))
    }

    fn filter_header_by_height(&self, height: u32) -> Result<FilterHash, StoreError> {
        self.chains
            .lock()
            .unwrap()
            .filter_headers
            .get(height as usize)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("filter header at height {height}")))
    }

    fn append_headers(&self, headers: &[BlockHeader]) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().unwrap();
        for header in headers {
            let tip = chains.headers[chains.headers.len() - 1].block_hash();
            if header.prev_block != tip {
                return Err(StoreError::Corruption(format!(
                    "header {} does not extend tip {tip}",
                    header.block_hash()
                )));
            }
            let height = chains.headers.len() as u32;
            chains.heights.insert(header.block_hash(), height);
            chains.headers.push(*header);
        }
        Ok(())
    }

    fn append_filter_headers(&self, headers: &[FilterHash]) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().unwrap();
        if chains.filter_headers.len() + headers.len() > chains.headers.len() {
            return Err(StoreError::Corruption(
                "filter headers would pass the block tip".into(),
            ));
        }
        chains.filter_headers.extend_from_slice(headers);
        Ok(())
    }

    fn rollback_last_block(&self) -> Result<BlockStamp, StoreError> {
        let mut chains = self.chains.lock().unwrap();
        if chains.headers.len() <= 1 {
            return Err(StoreError::Corruption("cannot roll back genesis".into()));
        }
        if let Some(removed) = chains.headers.pop() {
            chains.heights.remove(&removed.block_hash());
        }
        if chains.filter_headers.len() > chains.headers.len() {
            chains.filter_headers.pop();
        }
        let height = chains.headers.len() - 1;
        let tip = chains.headers[height];
        Ok(BlockStamp {
            height: height as u32,
            hash: tip.block_hash(),
            timestamp: tip.time(),
        })
    }
}

/// An in-memory ban store for testing.
#[derive(Default)]
pub struct NullBanStore {
    records: Mutex<HashMap<String, BanRecord>>,
}

impl NullBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BanStore for NullBanStore {
    fn put_ban(&self, host: &str, record: &BanRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(host.to_string(), record.clone());
        Ok(())
    }

    fn get_ban(&self, host: &str) -> Result<Option<BanRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(host).cloned())
    }

    fn delete_ban(&self, host: &str) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(host);
        Ok(())
    }

    fn iter_bans(&self) -> Result<Vec<(String, BanRecord)>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(host, record)| (host.clone(), record.clone()))
            .collect())
    }
}
