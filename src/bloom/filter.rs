//! Bloom filter over i64 keys
//!
//! ## Blob Format
//! ```text
//! ┌──────────────┬────────────┬────────────┬──────────────────────┐
//! │ Checksum (8) │ Hashes (4) │ Words (4)  │ Words × u64 (8 each) │
//! └──────────────┴────────────┴────────────┴──────────────────────┘
//! ```
//! Big-endian throughout.
//!
//! Bits live in atomic words, so membership queries and inserts never take a
//! lock. The layer above decides who may insert and when the filter is
//! replaced.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{KeystackError, Result};

/// Blob header: checksum (8) + hash count (4) + word count (4)
const BLOB_HEADER_SIZE: usize = 16;

const MIN_BITS: u64 = 64;

/// 2^33 bits = 1 GiB of filter
const MAX_BITS: u64 = 1 << 33;

const MAX_HASHES: u32 = 30;

/// Probabilistic set of i64 keys tagged with a data checksum
pub struct LongBloomFilter {
    words: Box<[AtomicU64]>,
    num_hashes: u32,
    /// Number of writes reflected in this filter
    checksum: AtomicI64,
}

impl LongBloomFilter {
    /// Size a filter for `expected_keys` keys at false-positive rate `fpp`
    pub fn with_capacity(expected_keys: u64, fpp: f64, checksum: i64) -> Self {
        let n = expected_keys.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;

        let optimal_bits = (-n * fpp.ln() / (ln2 * ln2)).ceil() as u64;
        let bits = optimal_bits
            .clamp(MIN_BITS, MAX_BITS)
            .next_power_of_two();

        let num_hashes = ((bits as f64 / n) * ln2).round() as u32;
        let num_hashes = num_hashes.clamp(1, MAX_HASHES);

        let words = (0..bits / 64).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            num_hashes,
            checksum: AtomicI64::new(checksum),
        }
    }

    fn from_parts(words: Vec<u64>, num_hashes: u32, checksum: i64) -> Self {
        Self {
            words: words.into_iter().map(AtomicU64::new).collect(),
            num_hashes,
            checksum: AtomicI64::new(checksum),
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn checksum(&self) -> i64 {
        self.checksum.load(Ordering::Acquire)
    }

    /// Record one more write as reflected in this filter
    pub(crate) fn bump_checksum(&self) {
        self.checksum.fetch_add(1, Ordering::AcqRel);
    }

    pub fn insert(&self, key: i64) {
        let mask = self.bit_count() - 1;
        for bit in probe_bits(key, self.num_hashes, mask) {
            self.words[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// False means the key was never inserted
    pub fn might_contain(&self, key: i64) -> bool {
        let mask = self.bit_count() - 1;
        probe_bits(key, self.num_hashes, mask)
            .all(|bit| self.words[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0)
    }

    pub fn set_bits(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }

    /// `(fraction of set bits) ^ hashes`
    pub fn estimated_fpp(&self) -> f64 {
        let fill = self.set_bits() as f64 / self.bit_count() as f64;
        fill.powi(self.num_hashes as i32)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOB_HEADER_SIZE + self.words.len() * 8);
        buf.put_i64(self.checksum());
        buf.put_u32(self.num_hashes);
        buf.put_u32(self.words.len() as u32);
        for word in self.words.iter() {
            buf.put_u64(word.load(Ordering::Relaxed));
        }
        buf.freeze()
    }

    pub fn from_bytes(mut blob: &[u8]) -> Result<Self> {
        if blob.len() < BLOB_HEADER_SIZE {
            return Err(KeystackError::Corruption(format!(
                "Bloom filter blob too short: {} bytes",
                blob.len()
            )));
        }

        let checksum = blob.get_i64();
        let num_hashes = blob.get_u32();
        let word_count = blob.get_u32() as usize;

        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(KeystackError::Corruption(format!(
                "Bloom filter hash count out of range: {}",
                num_hashes
            )));
        }
        if word_count == 0 || !word_count.is_power_of_two() {
            return Err(KeystackError::Corruption(format!(
                "Bloom filter word count must be a power of two, got {}",
                word_count
            )));
        }
        if blob.remaining() != word_count * 8 {
            return Err(KeystackError::Corruption(format!(
                "Bloom filter blob holds {} bytes of words, expected {}",
                blob.remaining(),
                word_count * 8
            )));
        }

        let words = (0..word_count).map(|_| blob.get_u64()).collect();
        Ok(Self::from_parts(words, num_hashes, checksum))
    }
}

/// Bit positions for `key`: double hashing over two mixes of the key
fn probe_bits(key: i64, num_hashes: u32, mask: u64) -> impl Iterator<Item = u64> {
    let h1 = mix64(key as u64);
    let h2 = mix64(h1 ^ 0x9E37_79B9_7F4A_7C15) | 1;
    (0..num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) & mask)
}

/// MurmurHash3 64-bit finalizer
fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

impl Clone for LongBloomFilter {
    fn clone(&self) -> Self {
        // checksum first: every write it counts has its bits set already
        let checksum = self.checksum();
        Self::from_parts(
            self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect(),
            self.num_hashes,
            checksum,
        )
    }
}

impl PartialEq for LongBloomFilter {
    fn eq(&self, other: &Self) -> bool {
        self.num_hashes == other.num_hashes
            && self.checksum() == other.checksum()
            && self.words.len() == other.words.len()
            && self
                .words
                .iter()
                .zip(other.words.iter())
                .all(|(a, b)| a.load(Ordering::Relaxed) == b.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for LongBloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongBloomFilter")
            .field("bits", &self.bit_count())
            .field("num_hashes", &self.num_hashes)
            .field("checksum", &self.checksum())
            .field("set_bits", &self.set_bits())
            .finish()
    }
}

impl Serialize for LongBloomFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_bytes().to_vec().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LongBloomFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let blob = Vec::<u8>::deserialize(deserializer)?;
        LongBloomFilter::from_bytes(&blob).map_err(serde::de::Error::custom)
    }
}
