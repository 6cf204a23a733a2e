//! Fingerprint stores used for duplicate detection.
//!
//! `seen` checks and marks in one step, so two racing enqueues of the same
//! fingerprint never both come back unseen.

use crate::error::SpiderError;
use async_trait::async_trait;
use dashmap::DashSet;
use moka::sync::Cache;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[async_trait]
pub trait DupeFilter: Send + Sync + 'static {
    /// Marks `fingerprint` and reports whether it had been marked before.
    async fn seen(&self, fingerprint: &str) -> Result<bool, SpiderError>;

    async fn clear(&self) -> Result<(), SpiderError>;

    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }
}

/// Exact in-memory set.
#[derive(Debug, Default)]
pub struct MemoryDupeFilter {
    fingerprints: DashSet<String>,
}

impl MemoryDupeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

#[async_trait]
impl DupeFilter for MemoryDupeFilter {
    async fn seen(&self, fingerprint: &str) -> Result<bool, SpiderError> {
        Ok(!self.fingerprints.insert(fingerprint.to_string()))
    }

    async fn clear(&self) -> Result<(), SpiderError> {
        self.fingerprints.clear();
        Ok(())
    }
}

/// A fixed-size bloom filter over string keys.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    pub fn new(num_bits: usize, num_hashes: usize) -> Self {
        let num_bits = num_bits.max(64);
        BloomFilter {
            bits: vec![0; num_bits.div_ceil(64)],
            num_bits,
            num_hashes: num_hashes.max(1),
        }
    }

    /// Sized for `capacity` keys at roughly a 1% false positive rate.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(capacity * 0.01f64.ln()) / (ln2 * ln2)).ceil() as usize;
        let num_hashes = ((num_bits as f64 / capacity) * ln2).round() as usize;
        BloomFilter::new(num_bits, num_hashes)
    }

    fn positions(&self, key: &str) -> impl Iterator<Item = usize> + '_ {
        let mut first = DefaultHasher::new();
        key.hash(&mut first);
        let h1 = first.finish();

        let mut second = DefaultHasher::new();
        (key, 0x9e37_79b9_7f4a_7c15u64).hash(&mut second);
        let h2 = second.finish() | 1;

        (0..self.num_hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits as u64) as usize)
    }

    pub fn add(&mut self, key: &str) {
        let positions: Vec<usize> = self.positions(key).collect();
        for bit in positions {
            self.bits[bit / 64] |= 1 << (bit % 64);
        }
    }

    pub fn might_contain(&self, key: &str) -> bool {
        self.positions(key)
            .all(|bit| self.bits[bit / 64] & (1 << (bit % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
    }
}

/// Bloom filter in front of a bounded exact cache.
///
/// A fingerprint counts as seen only when the bloom filter and the cache both
/// know it, so bloom false positives never filter a fresh request. Fingerprints
/// evicted from the cache may be crawled again.
pub struct BloomDupeFilter {
    bloom: RwLock<BloomFilter>,
    exact: Cache<String, ()>,
}

impl BloomDupeFilter {
    pub fn new(capacity: usize) -> Self {
        BloomDupeFilter {
            bloom: RwLock::new(BloomFilter::with_capacity(capacity)),
            exact: Cache::builder().max_capacity(capacity.max(1) as u64).build(),
        }
    }
}

#[async_trait]
impl DupeFilter for BloomDupeFilter {
    async fn seen(&self, fingerprint: &str) -> Result<bool, SpiderError> {
        let mut bloom = self.bloom.write();
        if bloom.might_contain(fingerprint) && self.exact.contains_key(fingerprint) {
            return Ok(true);
        }
        bloom.add(fingerprint);
        self.exact.insert(fingerprint.to_string(), ());
        Ok(false)
    }

    async fn clear(&self) -> Result<(), SpiderError> {
        self.bloom.write().clear();
        self.exact.invalidate_all();
        Ok(())
    }
}
