//! Network message types for node-to-node communication.
//!
//! The chain service speaks in terms of [`Message`]; the byte layout used on a
//! given link is owned by the [`codec`] module (or by whatever transport the
//! embedding application supplies).

pub mod codec;

use cfnode_types::{
    Block, BlockHash, BlockHeader, GcsFilter, NetAddress, ServiceFlags, Timestamp, Transaction,
    Txid,
};
use serde::{Deserialize, Serialize};

pub use codec::{read_frame, write_frame, CodecError, MAX_MESSAGE_SIZE};

/// Protocol version advertised by this node.
pub const PROTOCOL_VERSION: u32 = 70013;
/// First version whose address announcements carry timestamps.
pub const NET_ADDRESS_TIME_VERSION: u32 = 31402;
/// First version understanding `sendheaders`.
pub const SEND_HEADERS_VERSION: u32 = 70012;
/// First version understanding `feefilter`.
pub const FEE_FILTER_VERSION: u32 = 70013;
/// Maximum inventory vectors per inv/getdata message.
pub const MAX_INV_PER_MSG: usize = 50_000;
/// Maximum addresses per addr message.
pub const MAX_ADDR_PER_MSG: usize = 1_000;

/// All messages exchanged with peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    GetAddr,
    Addr(AddrMessage),
    Inv(InvMessage),
    GetData(InvMessage),
    GetHeaders(GetHeadersMessage),
    Headers(HeadersMessage),
    SendHeaders,
    FeeFilter(FeeFilterMessage),
    Reject(RejectMessage),
    Tx(Transaction),
    Block(Block),
    GetCFilters(GetCFiltersMessage),
    CFilter(CFilterMessage),
    Ping(u64),
    Pong(u64),
}

impl Message {
    /// Protocol command name.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::GetAddr => "getaddr",
            Self::Addr(_) => "addr",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::GetHeaders(_) => "getheaders",
            Self::Headers(_) => "headers",
            Self::SendHeaders => "sendheaders",
            Self::FeeFilter(_) => "feefilter",
            Self::Reject(_) => "reject",
            Self::Tx(_) => "tx",
            Self::Block(_) => "block",
            Self::GetCFilters(_) => "getcfilters",
            Self::CFilter(_) => "cfilter",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
        }
    }

    /// Encoded size in bytes, used for traffic accounting.
    pub fn serialized_size(&self) -> u64 {
        bincode::serialized_size(self).unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub timestamp: Timestamp,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    /// The sender does not want transactions relayed to it.
    pub disable_relay_tx: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrMessage {
    pub addresses: Vec<NetAddress>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessTx,
    WitnessBlock,
}

/// One inventory vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: [u8; 32],
}

impl InvVect {
    pub fn tx(txid: Txid) -> Self {
        Self {
            inv_type: InvType::Tx,
            hash: *txid.as_bytes(),
        }
    }

    pub fn witness_tx(txid: Txid) -> Self {
        Self {
            inv_type: InvType::WitnessTx,
            hash: *txid.as_bytes(),
        }
    }

    pub fn block(hash: BlockHash) -> Self {
        Self {
            inv_type: InvType::Block,
            hash: *hash.as_bytes(),
        }
    }

    pub fn witness_block(hash: BlockHash) -> Self {
        Self {
            inv_type: InvType::WitnessBlock,
            hash: *hash.as_bytes(),
        }
    }

    /// The transaction id, when this vector announces a transaction.
    pub fn txid(&self) -> Option<Txid> {
        match self.inv_type {
            InvType::Tx | InvType::WitnessTx => Some(Txid::new(self.hash)),
            _ => None,
        }
    }

    pub fn block_hash(&self) -> Option<BlockHash> {
        match self.inv_type {
            InvType::Block | InvType::WitnessBlock => Some(BlockHash::new(self.hash)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvMessage {
    pub items: Vec<InvVect>,
}

impl InvMessage {
    pub fn new(items: Vec<InvVect>) -> Self {
        Self { items }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHeadersMessage {
    pub locator: Vec<BlockHash>,
    pub stop_hash: BlockHash,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersMessage {
    pub headers: Vec<BlockHeader>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeFilterMessage {
    /// Minimum fee rate, in smallest units per kilobyte.
    pub min_fee: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub command: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<[u8; 32]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCFiltersMessage {
    pub start_height: u32,
    pub stop_hash: BlockHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFilterMessage {
    pub block_hash: BlockHash,
    pub filter: GcsFilter,
}
