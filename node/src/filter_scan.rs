//! Filter scanner: find the first block in a batch with wallet-relevant
//! transactions.
//!
//! For each block the compact filter is polled until available and matched
//! against the watch list. Only on a filter match is the full block fetched
//! and its transactions checked; a match that turns out to contain nothing
//! relevant is a false positive and the scan moves on. Outputs paying a
//! watched script add their outpoint to the watch list for later blocks in
//! the same scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use cfnode_types::gcs::derive_key;
use cfnode_types::{Block, BlockHash, BlockMeta, GcsFilter, OutPoint, Script, Transaction};

use crate::NodeError;

/// Where the scanner gets filters and blocks.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// The block's filter, or `None` if it is not available yet.
    async fn get_cfilter(&self, hash: &BlockHash) -> Result<Option<GcsFilter>, NodeError>;

    async fn get_block(&self, hash: &BlockHash) -> Result<Block, NodeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

/// What to scan and what to look for.
#[derive(Clone, Debug, Default)]
pub struct FilterBlocksRequest {
    pub blocks: Vec<BlockMeta>,
    /// Receive scripts by derivation index.
    pub external_addrs: BTreeMap<u32, Script>,
    /// Change scripts by derivation index.
    pub internal_addrs: BTreeMap<u32, Script>,
    pub imported_addrs: Vec<Script>,
    /// Outpoints whose spends are relevant, with the script they pay.
    pub watched_outpoints: HashMap<OutPoint, Script>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterBlocksResponse {
    /// Index into the request's `blocks`.
    pub batch_index: usize,
    pub block_meta: BlockMeta,
    pub found_external_addrs: BTreeSet<u32>,
    pub found_internal_addrs: BTreeSet<u32>,
    /// Outputs in the block that pay a watched script.
    pub found_outpoints: HashMap<OutPoint, Script>,
    pub relevant_txns: Vec<Transaction>,
}

/// Scan `req.blocks` in order and stop at the first block that really
/// contains a relevant transaction. `Ok(None)` means nothing matched.
pub async fn filter_blocks<S>(
    source: &S,
    req: &FilterBlocksRequest,
    poll: PollPolicy,
) -> Result<Option<FilterBlocksResponse>, NodeError>
where
    S: ChainSource + ?Sized,
{
    let mut filterer = BlockFilterer::new(req);

    for (batch_index, meta) in req.blocks.iter().enumerate() {
        let filter = poll_cfilter(source, &meta.hash, poll).await?;
        if filter.n() == 0 {
            continue;
        }

        let watch_list = filterer.watch_list();
        let items: Vec<&[u8]> = watch_list.iter().map(|s| s.as_bytes()).collect();
        if !filter.match_any(&derive_key(&meta.hash), &items)? {
            continue;
        }

        let block = source.get_block(&meta.hash).await?;
        if !filterer.filter_block(&block) {
            tracing::trace!(height = meta.height, hash = %meta.hash, "filter false positive");
            continue;
        }

        tracing::debug!(
            height = meta.height,
            hash = %meta.hash,
            txns = filterer.relevant_txns.len(),
            "found relevant block"
        );
        return Ok(Some(filterer.into_response(batch_index, *meta)));
    }
    Ok(None)
}

/// Fetch a filter, retrying while it is absent.
async fn poll_cfilter<S>(source: &S, hash: &BlockHash, poll: PollPolicy) -> Result<GcsFilter, NodeError>
where
    S: ChainSource + ?Sized,
{
    for attempt in 0..poll.attempts {
        if attempt > 0 {
            tokio::time::sleep(poll.interval).await;
        }
        match source.get_cfilter(hash).await {
            Ok(Some(filter)) => return Ok(filter),
            Ok(None) => {}
            Err(e) => tracing::debug!(hash = %hash, attempt, error = %e, "filter fetch failed"),
        }
    }
    Err(NodeError::FilterUnavailable {
        hash: *hash,
        attempts: poll.attempts,
    })
}

struct BlockFilterer {
    external: HashMap<Script, u32>,
    internal: HashMap<Script, u32>,
    imported: Vec<Script>,
    watched: HashMap<OutPoint, Script>,
    found_external: BTreeSet<u32>,
    found_internal: BTreeSet<u32>,
    found_outpoints: HashMap<OutPoint, Script>,
    relevant_txns: Vec<Transaction>,
}

impl BlockFilterer {
    fn new(req: &FilterBlocksRequest) -> Self {
        Self {
            external: req.external_addrs.iter().map(|(i, s)| (s.clone(), *i)).collect(),
            internal: req.internal_addrs.iter().map(|(i, s)| (s.clone(), *i)).collect(),
            imported: req.imported_addrs.clone(),
            watched: req.watched_outpoints.clone(),
            found_external: BTreeSet::new(),
            found_internal: BTreeSet::new(),
            found_outpoints: HashMap::new(),
            relevant_txns: Vec::new(),
        }
    }

    /// Every script whose appearance in a filter warrants fetching the block.
    fn watch_list(&self) -> Vec<Script> {
        let mut list: Vec<Script> = self
            .external
            .keys()
            .chain(self.internal.keys())
            .chain(self.imported.iter())
            .chain(self.watched.values())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        list.dedup();
        list
    }

    fn filter_block(&mut self, block: &Block) -> bool {
        let mut relevant = false;
        for tx in &block.transactions {
            if self.filter_tx(tx) {
                self.relevant_txns.push(tx.clone());
                relevant = true;
            }
        }
        relevant
    }

    fn filter_tx(&mut self, tx: &Transaction) -> bool {
        let mut relevant = tx
            .inputs
            .iter()
            .any(|input| self.watched.contains_key(&input.previous_output));

        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            let script = &output.script_pubkey;
            if let Some(index) = self.external.get(script) {
                self.found_external.insert(*index);
            } else if let Some(index) = self.internal.get(script) {
                self.found_internal.insert(*index);
            } else if !self.imported.contains(script) {
                continue;
            }
            relevant = true;
            let outpoint = OutPoint::new(txid, vout as u32);
            self.watched.insert(outpoint, script.clone());
            self.found_outpoints.insert(outpoint, script.clone());
        }
        relevant
    }

    fn into_response(self, batch_index: usize, block_meta: BlockMeta) -> FilterBlocksResponse {
        FilterBlocksResponse {
            batch_index,
            block_meta,
            found_external_addrs: self.found_external,
            found_internal_addrs: self.found_internal,
            found_outpoints: self.found_outpoints,
            relevant_txns: self.relevant_txns,
        }
    }
}
