//! Bloom filter over pattern IDs, used as a fast-fail gate before any tier
//! lookup.

use crate::codec::mix64;

/// Number of hash functions.
pub const HASH_COUNT: usize = 3;

/// Per-hash seeds mixed into the ID before avalanche hashing.
const SEEDS: [u64; HASH_COUNT] = [
    0x9E37_79B9_7F4A_7C15,
    0xC2B2_AE3D_27D4_EB4F,
    0x1656_67B1_9E37_79F9,
];

/// Default bit-array size (1 Mi bits = 128 KiB).
pub const DEFAULT_NUM_BITS: usize = 1 << 20;

/// Fixed-size Bloom filter over pattern IDs. No false negatives; false
/// positives at roughly [`BloomFilter::estimate_false_positive_rate`].
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
}

impl BloomFilter {
    /// Create an empty filter of `num_bits` bits (at least 64).
    pub fn new(num_bits: usize) -> Self {
        let num_bits = num_bits.max(64);
        let words = num_bits.div_ceil(64);
        Self {
            bits: vec![0; words],
            num_bits,
        }
    }

    /// Size the filter for `expected_items` at the target false-positive rate,
    /// with the hash count fixed at [`HASH_COUNT`].
    pub fn with_rate(false_positive_rate: f64, expected_items: usize) -> Self {
        // Solve p = (1 - e^{-kn/m})^k for m.
        let k = HASH_COUNT as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let n = expected_items.max(1) as f64;
        let m = -k * n / (1.0 - p.powf(1.0 / k)).ln();
        Self::new(m.ceil() as usize)
    }

    #[inline]
    fn positions(&self, id: u64) -> [usize; HASH_COUNT] {
        let mut out = [0usize; HASH_COUNT];
        for (slot, seed) in out.iter_mut().zip(SEEDS) {
            *slot = (mix64(id ^ seed) % self.num_bits as u64) as usize;
        }
        out
    }

    /// Set the [`HASH_COUNT`] bits for `id`.
    pub fn add(&mut self, id: u64) {
        for pos in self.positions(id) {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    /// True if every bit for `id` is set. Never false for an added ID.
    pub fn contains(&self, id: u64) -> bool {
        self.positions(id)
            .iter()
            .all(|&pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }

    /// Analytic false-positive estimate after `n` insertions:
    /// `(1 - e^{-kn/m})^k`.
    pub fn estimate_false_positive_rate(&self, n: usize) -> f64 {
        let k = HASH_COUNT as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n as f64 / m).exp()).powf(k)
    }

    /// Reset every bit.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Fraction of bits currently set.
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.bits.iter().map(|w| w.count_ones() as u64).sum();
        set as f64 / self.num_bits as f64
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = BloomFilter::new(8192);
        for id in 1..=1000u64 {
            bloom.add(id);
        }
        for id in 1..=1000u64 {
            assert!(bloom.contains(id), "false negative for {id}");
        }
    }

    #[test]
    fn test_empty_contains_nothing() {
        let bloom = BloomFilter::new(1024);
        assert!(!bloom.contains(1));
        assert!(!bloom.contains(u64::MAX));
    }

    #[test]
    fn test_false_positive_rate_tracks_estimate() {
        let n = 2000;
        let mut bloom = BloomFilter::new(16 * n);
        for id in 0..n as u64 {
            bloom.add(id);
        }
        let lookups = 50_000u64;
        let hits = (0..lookups)
            .map(|i| 1_000_000 + i)
            .filter(|&id| bloom.contains(id))
            .count();
        let observed = hits as f64 / lookups as f64;
        let expected = bloom.estimate_false_positive_rate(n);
        assert!(
            (observed - expected).abs() < 0.01,
            "observed {observed:.4} vs expected {expected:.4}"
        );
    }

    #[test]
    fn test_with_rate_sizes_filter() {
        let bloom = BloomFilter::with_rate(0.01, 10_000);
        let estimate = bloom.estimate_false_positive_rate(10_000);
        assert!(estimate <= 0.011, "estimate {estimate}");
    }

    #[test]
    fn test_clear() {
        let mut bloom = BloomFilter::new(1024);
        bloom.add(42);
        assert!(bloom.fill_ratio() > 0.0);
        bloom.clear();
        assert!(!bloom.contains(42));
        assert_eq!(bloom.fill_ratio(), 0.0);
    }
}
