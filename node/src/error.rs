use cfnode_types::BlockHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] cfnode_store::StoreError),

    #[error("network error: {0}")]
    Network(#[from] cfnode_network::NetworkError),

    #[error("types error: {0}")]
    Types(#[from] cfnode_types::TypesError),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] cfnode_store_lmdb::LmdbError),

    #[error("config error: {0}")]
    Config(String),

    #[error("filter for block {hash} unavailable after {attempts} attempts")]
    FilterUnavailable { hash: BlockHash, attempts: u32 },

    #[error("block {0} could not be retrieved from any peer")]
    BlockUnavailable(BlockHash),

    #[error("no connected peers")]
    NoPeers,

    #[error("chain service is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
