//! Filter scanning against a live peer that serves filters and blocks.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cfnode_messages::{CFilterMessage, Message};
use cfnode_network::RemoteEnd;
use cfnode_node::FilterBlocksRequest;
use cfnode_nullables::{handshake, peer_version, NullHeaderStore};
use cfnode_types::gcs::derive_key;
use cfnode_types::{Block, BlockMeta, GcsFilter, OutPoint, Script, Transaction, TxIn, TxOut, Txid};
use tokio::task::JoinHandle;

use common::{full_services, node, persistent_config, wait_for_peers};

const PEER: &str = "8.8.4.4:8333";

#[derive(Default)]
struct Served {
    filters: AtomicUsize,
    blocks: AtomicUsize,
}

fn payment(tag: u8, pays: Script) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TxIn {
            previous_output: OutPoint::new(Txid::hash(&[tag]), 0),
            script_sig: Script::new(vec![]),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50_000,
            script_pubkey: pays,
        }],
        lock_time: 0,
    }
}

fn filter_for(block: &Block) -> GcsFilter {
    let scripts: Vec<&[u8]> = block
        .transactions
        .iter()
        .flat_map(|tx| tx.outputs.iter().map(|out| out.script_pubkey.as_bytes()))
        .collect();
    GcsFilter::build(&derive_key(&block.block_hash()), &scripts)
}

fn wallet_script() -> Script {
    Script::new(vec![0x00, 0x14, 0xab, 0xcd, 0xef, 0x01])
}

/// Chain of `count` blocks above genesis; the block at `paying` (0-based)
/// pays the wallet script.
fn chain(headers: &NullHeaderStore, count: u32, paying: Option<usize>) -> Vec<Block> {
    let blocks: Vec<Block> = headers
        .extend(count)
        .into_iter()
        .enumerate()
        .map(|(i, header)| {
            let pays = if Some(i) == paying {
                wallet_script()
            } else {
                Script::new(vec![0x51, i as u8])
            };
            Block {
                header,
                transactions: vec![payment(i as u8, pays)],
            }
        })
        .collect();
    let filters: Vec<GcsFilter> = blocks.iter().map(filter_for).collect();
    headers.append_filters(&filters);
    blocks
}

fn serve(mut remote: RemoteEnd, blocks: Vec<Block>) -> (JoinHandle<()>, Arc<Served>) {
    let served = Arc::new(Served::default());
    let counts = served.clone();
    let task = tokio::spawn(async move {
        while let Some(msg) = remote.sent.recv().await {
            let reply = match msg {
                Message::GetCFilters(req) => {
                    let Some(block) = blocks.iter().find(|b| b.block_hash() == req.stop_hash) else {
                        continue;
                    };
                    counts.filters.fetch_add(1, Ordering::SeqCst);
                    Message::CFilter(CFilterMessage {
                        block_hash: req.stop_hash,
                        filter: filter_for(block),
                    })
                }
                Message::GetData(inv) => {
                    let Some(block) = inv.items.iter().find_map(|item| {
                        blocks
                            .iter()
                            .find(|b| *b.block_hash().as_bytes() == item.hash)
                    }) else {
                        continue;
                    };
                    counts.blocks.fetch_add(1, Ordering::SeqCst);
                    Message::Block(block.clone())
                }
                _ => continue,
            };
            if remote.deliver.send(reply).await.is_err() {
                break;
            }
        }
    });
    (task, served)
}

fn request(blocks: &[Block]) -> FilterBlocksRequest {
    FilterBlocksRequest {
        blocks: blocks
            .iter()
            .enumerate()
            .map(|(i, b)| BlockMeta {
                height: i as u32 + 1,
                hash: b.block_hash(),
            })
            .collect(),
        external_addrs: BTreeMap::from([(7, wallet_script())]),
        ..FilterBlocksRequest::default()
    }
}

#[tokio::test]
async fn scan_fetches_only_the_matching_block() {
    let headers = NullHeaderStore::new();
    let blocks = chain(&headers, 5, Some(2));
    let mut n = node(persistent_config(&[PEER]), headers);
    n.service.start().unwrap();

    let mut dialed = n.links.recv().await.unwrap();
    handshake(&mut dialed.remote, peer_version(full_services(), 5))
        .await
        .unwrap();
    wait_for_peers(&n.service, 1).await;
    let (server, served) = serve(dialed.remote, blocks.clone());

    let found = n
        .service
        .filter_blocks(&request(&blocks))
        .await
        .unwrap()
        .expect("block 3 pays the wallet");
    assert_eq!(found.batch_index, 2);
    assert_eq!(found.block_meta.height, 3);
    assert_eq!(found.block_meta.hash, blocks[2].block_hash());
    assert!(found.found_external_addrs.contains(&7));
    assert!(found.found_internal_addrs.is_empty());
    assert_eq!(found.relevant_txns, blocks[2].transactions);
    let paid = OutPoint::new(blocks[2].transactions[0].txid(), 0);
    assert_eq!(found.found_outpoints.get(&paid), Some(&wallet_script()));

    assert_eq!(served.filters.load(Ordering::SeqCst), 3);
    assert_eq!(served.blocks.load(Ordering::SeqCst), 1);
    let metrics = n.service.metrics();
    assert_eq!(metrics.filter_matches.get(), 1);
    assert_eq!(metrics.block_fetches.get(), 1);

    n.service.stop().await;
    server.abort();
}

#[tokio::test]
async fn scan_without_a_match_fetches_no_blocks_and_reuses_cached_filters() {
    let headers = NullHeaderStore::new();
    let blocks = chain(&headers, 4, None);
    let mut n = node(persistent_config(&[PEER]), headers);
    n.service.start().unwrap();

    let mut dialed = n.links.recv().await.unwrap();
    handshake(&mut dialed.remote, peer_version(full_services(), 4))
        .await
        .unwrap();
    wait_for_peers(&n.service, 1).await;
    let (server, served) = serve(dialed.remote, blocks.clone());

    let req = request(&blocks);
    assert_eq!(n.service.filter_blocks(&req).await.unwrap(), None);
    assert_eq!(served.filters.load(Ordering::SeqCst), 4);
    assert_eq!(served.blocks.load(Ordering::SeqCst), 0);

    assert_eq!(n.service.filter_blocks(&req).await.unwrap(), None);
    assert_eq!(served.filters.load(Ordering::SeqCst), 4);
    assert_eq!(n.service.metrics().filter_matches.get(), 0);

    n.service.stop().await;
    server.abort();
}
