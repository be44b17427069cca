/// Validator bitmap
///
/// Fixed-width bit vector recording which validator indices contributed
/// to an aggregate signature. The width is the validator-set size at the
/// height the certificate was formed for.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorBitmap {
    size: u32,
    words: Vec<u64>,
}

impl ValidatorBitmap {
    pub fn new(size: u32) -> Self {
        let words = vec![0u64; (size as usize + 63) / 64];
        Self { size, words }
    }

    /// Number of addressable bits
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Set bit `index`; out-of-range indices are ignored and reported as `false`
    pub fn set(&mut self, index: u32, value: bool) -> bool {
        if index >= self.size {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        if value {
            self.words[word] |= 1u64 << bit;
        } else {
            self.words[word] &= !(1u64 << bit);
        }
        true
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.size {
            return false;
        }
        self.words[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn popcount(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Bitwise OR; the result is as wide as the wider operand
    pub fn union(&self, other: &ValidatorBitmap) -> ValidatorBitmap {
        let size = self.size.max(other.size);
        let mut out = ValidatorBitmap::new(size);
        for (i, word) in out.words.iter_mut().enumerate() {
            let a = self.words.get(i).copied().unwrap_or(0);
            let b = other.words.get(i).copied().unwrap_or(0);
            *word = a | b;
        }
        out
    }

    /// True when some index is set in both bitmaps
    pub fn intersects(&self, other: &ValidatorBitmap) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Indices of set bits in ascending order
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.size).filter(move |i| self.get(*i))
    }
}

impl fmt::Debug for ValidatorBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String = (0..self.size)
            .map(|i| if self.get(i) { 'x' } else { '_' })
            .collect();
        write!(f, "BA{{{}:{}}}", self.size, bits)
    }
}
