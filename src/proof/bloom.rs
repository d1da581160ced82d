//! Bloom filter with explicit size/hash-count formulas.
//!
//! `m = ⌈-n·ln(p)/(ln 2)²⌉` bits, `k = ⌈(m/n)·ln 2⌉` hash functions, `k`
//! positions derived from two domain-separated SHA-256 digests via
//! double-hashing (`(h1 + i·h2) mod m`).

use bitvec::prelude::{BitVec, Lsb0};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// A classic Bloom filter over arbitrary byte-serializable items.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: BitVec<u8, Lsb0>,
    hash_count: u32,
    inserted: u64,
}

impl BloomFilter {
    /// Sizes a filter for `expected_insertions` items at target false
    /// positive rate `target_fpr`.
    #[must_use]
    pub fn new(expected_insertions: usize, target_fpr: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let p = target_fpr.clamp(f64::MIN_POSITIVE, 0.999);
        let m = (-(n * p.ln()) / std::f64::consts::LN_2.powi(2)).ceil().max(8.0);
        let k = ((m / n) * std::f64::consts::LN_2).ceil().max(1.0);
        Self {
            bits: BitVec::repeat(false, m as usize),
            hash_count: k as u32,
            inserted: 0,
        }
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h1 = u64::from_be_bytes(Hash::digest(&[b"bloom-h1", item]).as_bytes()[..8].try_into().expect("8 bytes"));
        let h2 = u64::from_be_bytes(Hash::digest(&[b"bloom-h2", item]).as_bytes()[..8].try_into().expect("8 bytes"));
        let m = self.bits.len() as u64;
        (0..self.hash_count).map(move |i| (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % m) as usize)
    }

    /// Inserts `item` into the filter.
    pub fn insert(&mut self, item: &[u8]) {
        let positions: Vec<usize> = self.positions(item).collect();
        for pos in positions {
            self.bits.set(pos, true);
        }
        self.inserted += 1;
    }

    /// Tests membership. A `false` result is definitive; a `true` result may
    /// be a false positive — correctness must not depend on this alone.
    #[must_use]
    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item).all(|pos| self.bits[pos])
    }

    /// Number of items inserted since construction or the last [`BloomFilter::clear`].
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inserted
    }

    /// Whether no items have been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// Clears all bits and the insertion counter, keeping the same sizing.
    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.inserted = 0;
    }

    /// Estimated current false-positive rate given the bits actually set.
    #[must_use]
    pub fn current_false_positive_rate(&self) -> f64 {
        let set_bits = self.bits.count_ones() as f64;
        let m = self.bits.len() as f64;
        (set_bits / m).powi(self.hash_count as i32)
    }
}
