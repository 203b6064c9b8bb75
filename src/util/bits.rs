//! Fixed-length bit sets used for live documents.

use bit_vec::BitVec;

/// Read-only random access to a set of bits.
pub trait Bits: Send + Sync {
    fn get(&self, index: usize) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A bit set of fixed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBitSet {
    bits: BitVec,
}

impl FixedBitSet {
    /// All bits clear.
    pub fn new(num_bits: usize) -> Self {
        FixedBitSet {
            bits: BitVec::from_elem(num_bits, false),
        }
    }

    /// All bits set, the usual starting point for live docs.
    pub fn new_all_set(num_bits: usize) -> Self {
        FixedBitSet {
            bits: BitVec::from_elem(num_bits, true),
        }
    }

    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    /// Clears `index` and reports whether it was set before.
    pub fn get_and_clear(&mut self, index: usize) -> bool {
        let was_set = self.get(index);
        if was_set {
            self.bits.set(index, false);
        }
        was_set
    }

    pub fn cardinality(&self) -> usize {
        self.bits.iter().filter(|b| *b).count()
    }

    /// Indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| if b { Some(i) } else { None })
    }

    /// Packs the bits into 64-bit words, bit `i` at position `i % 64` of word `i / 64`.
    pub fn to_words(&self) -> Vec<u64> {
        let mut words = vec![0u64; self.bits.len().div_ceil(64)];
        for i in self.iter_set() {
            words[i >> 6] |= 1u64 << (i & 63);
        }
        words
    }

    pub fn from_words(words: &[u64], num_bits: usize) -> Self {
        let mut set = FixedBitSet::new(num_bits);
        for i in 0..num_bits {
            if words[i >> 6] & (1u64 << (i & 63)) != 0 {
                set.set(i);
            }
        }
        set
    }
}

impl Bits for FixedBitSet {
    fn get(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.bits.len()
    }
}
