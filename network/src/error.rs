use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("dial to {0} timed out")]
    DialTimeout(SocketAddr),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("link closed")]
    LinkClosed,

    #[error("send queue full")]
    QueueFull,

    #[error("no valid connect address")]
    NoCandidate,

    #[error("codec error: {0}")]
    Codec(#[from] cfnode_messages::CodecError),

    #[error("store error: {0}")]
    Store(#[from] cfnode_store::StoreError),

    #[error("IO error: {0}")]
    Io(String),
}
