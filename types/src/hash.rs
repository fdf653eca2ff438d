//! 32-byte hash types for blocks, transactions and filter headers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Double SHA-256, the hash used for block headers, txids and filter headers.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Hash arbitrary bytes with double SHA-256.
            pub fn hash(data: &[u8]) -> Self {
                Self(sha256d(data))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| TypesError::InvalidHex(e.to_string()))?;
                let arr: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| TypesError::InvalidLength { expected: 32, actual: bytes.len() })?;
                Ok(Self(arr))
            }
        }
    };
}

hash_newtype!(
    /// Identifies a block by the double SHA-256 of its header.
    BlockHash
);

hash_newtype!(
    /// Identifies a transaction.
    Txid
);

hash_newtype!(
    /// A filter header: commits to a compact filter and the previous filter header.
    FilterHash
);

impl FilterHash {
    /// Chain a filter onto the previous filter header.
    pub fn chain(filter_bytes: &[u8], prev: &FilterHash) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&sha256d(filter_bytes));
        buf.extend_from_slice(prev.as_bytes());
        Self(sha256d(&buf))
    }
}
