//! Golomb-coded set (GCS) compact block filters.
//!
//! Each filter commits to the scripts relevant to one block. Items are hashed
//! with SipHash-2-4 keyed by the first 16 bytes of the block hash, mapped onto
//! `[0, N * M)`, sorted, delta-encoded and Golomb-Rice coded with parameter `P`.
//! A client tests its whole watch list against a filter in one merge pass.

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

use crate::{BlockHash, TypesError};

/// Golomb-Rice parameter.
pub const FILTER_P: u8 = 19;

/// False-positive modulus.
pub const FILTER_M: u64 = 784_931;

/// Length of the SipHash key derived from a block hash.
pub const KEY_SIZE: usize = 16;

/// A compact filter: element count plus the Golomb-Rice bitstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsFilter {
    n: u32,
    data: Vec<u8>,
}

/// Derive the filter key from the block the filter covers.
pub fn derive_key(block_hash: &BlockHash) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&block_hash.as_bytes()[..KEY_SIZE]);
    key
}

impl GcsFilter {
    /// Wrap an encoded filter received from a peer.
    pub fn from_parts(n: u32, data: Vec<u8>) -> Self {
        Self { n, data }
    }

    /// Build a filter over `items`. Duplicate items are collapsed.
    pub fn build(key: &[u8; KEY_SIZE], items: &[&[u8]]) -> Self {
        let mut unique: Vec<&[u8]> = items.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let n = unique.len() as u64;
        let modulus = n * FILTER_M;
        let mut values: Vec<u64> = unique
            .iter()
            .map(|item| hash_to_range(key, item, modulus))
            .collect();
        values.sort_unstable();

        let mut writer = BitWriter::default();
        let mut last = 0u64;
        for value in values {
            let delta = value - last;
            writer.write_golomb(delta);
            last = value;
        }

        Self {
            n: n as u32,
            data: writer.finish(),
        }
    }

    /// Number of elements committed to.
    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serialization committed to by the filter header chain.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&self.n.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Whether any of `items` may be in the set.
    ///
    /// False positives occur with probability about `1 / M` per item; false
    /// negatives never occur for a well-formed filter.
    pub fn match_any(&self, key: &[u8; KEY_SIZE], items: &[&[u8]]) -> Result<bool, TypesError> {
        if self.n == 0 || items.is_empty() {
            return Ok(false);
        }
        let modulus = u64::from(self.n) * FILTER_M;
        let mut targets: Vec<u64> = items
            .iter()
            .map(|item| hash_to_range(key, item, modulus))
            .collect();
        targets.sort_unstable();

        let mut reader = BitReader::new(&self.data);
        let mut value = 0u64;
        let mut targets = targets.into_iter().peekable();
        for _ in 0..self.n {
            value += reader.read_golomb()?;
            while let Some(&target) = targets.peek() {
                if target == value {
                    return Ok(true);
                }
                if target > value {
                    break;
                }
                targets.next();
            }
            if targets.peek().is_none() {
                return Ok(false);
            }
        }
        Ok(false)
    }
}

fn hash_to_range(key: &[u8; KEY_SIZE], item: &[u8], modulus: u64) -> u64 {
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&key[..8]);
    k1.copy_from_slice(&key[8..]);
    let mut hasher = SipHasher24::new_with_keys(u64::from_le_bytes(k0), u64::from_le_bytes(k1));
    hasher.write(item);
    let hash = hasher.finish();
    ((u128::from(hash) * u128::from(modulus)) >> 64) as u64
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    used: u8,
}

impl BitWriter {
    fn write_bit(&mut self, bit: bool) {
        if self.used == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 0x80 >> self.used;
            }
        }
        self.used = (self.used + 1) % 8;
    }

    fn write_golomb(&mut self, value: u64) {
        let quotient = value >> FILTER_P;
        for _ in 0..quotient {
            self.write_bit(true);
        }
        self.write_bit(false);
        for i in (0..FILTER_P).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, TypesError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| TypesError::MalformedFilter("unexpected end of bitstream".into()))?;
        let bit = byte & (0x80 >> (self.pos % 8)) != 0;
        self.pos += 1;
        Ok(bit)
    }

    fn read_golomb(&mut self) -> Result<u64, TypesError> {
        let mut quotient = 0u64;
        while self.read_bit()? {
            quotient += 1;
        }
        let mut remainder = 0u64;
        for _ in 0..FILTER_P {
            remainder = (remainder << 1) | u64::from(self.read_bit()?);
        }
        Ok((quotient << FILTER_P) | remainder)
    }
}
