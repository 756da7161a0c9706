//! Fixed-length bitset over `u64` words.
//!
//! Search helpers follow the usual kernel convention: a range is
//! `[start, end)` and "not found" is reported as `end`. Bits at or past
//! `len()` are never set, so word-level scans can ignore the tail.

use alloc::vec;
use alloc::vec::Vec;

const WORD_BITS: usize = u64::BITS as usize;

#[inline(always)]
const fn word_index(bit: usize) -> usize {
    bit / WORD_BITS
}

#[inline(always)]
const fn bit_mask(bit: usize) -> u64 {
    1u64 << (bit % WORD_BITS)
}

/// Mask of the bits of word `index` that fall inside `[start, end)`.
#[inline]
fn range_mask(index: usize, start: usize, end: usize) -> u64 {
    let word_start = index * WORD_BITS;
    let lo = start.saturating_sub(word_start);
    let hi = (end - word_start).min(WORD_BITS);
    let upper = if hi == WORD_BITS { !0 } else { (1u64 << hi) - 1 };
    upper & (!0u64 << lo)
}

#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    pub fn new(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(WORD_BITS)],
            nbits,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nbits
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.nbits);
        self.words[word_index(bit)] & bit_mask(bit) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[word_index(bit)] |= bit_mask(bit);
    }

    #[inline]
    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.words[word_index(bit)] &= !bit_mask(bit);
    }

    pub fn set_range(&mut self, start: usize, len: usize) {
        let end = start + len;
        debug_assert!(end <= self.nbits);
        if len == 0 {
            return;
        }
        for index in word_index(start)..=word_index(end - 1) {
            self.words[index] |= range_mask(index, start, end);
        }
    }

    pub fn clear_range(&mut self, start: usize, len: usize) {
        let end = start + len;
        debug_assert!(end <= self.nbits);
        if len == 0 {
            return;
        }
        for index in word_index(start)..=word_index(end - 1) {
            self.words[index] &= !range_mask(index, start, end);
        }
    }

    /// Set every bit.
    pub fn fill(&mut self) {
        let nbits = self.nbits;
        self.set_range(0, nbits);
    }

    /// First set bit in `[start, end)`, or `end`.
    pub fn find_next_bit(&self, start: usize, end: usize) -> usize {
        self.find_next(start, end, false)
    }

    /// First clear bit in `[start, end)`, or `end`.
    pub fn find_next_zero_bit(&self, start: usize, end: usize) -> usize {
        self.find_next(start, end, true)
    }

    fn find_next(&self, start: usize, end: usize, invert: bool) -> usize {
        let end = end.min(self.nbits);
        if start >= end {
            return end;
        }
        let flip = if invert { !0u64 } else { 0 };
        let mut index = word_index(start);
        let mut word = (self.words[index] ^ flip) & (!0u64 << (start % WORD_BITS));
        loop {
            if word != 0 {
                let bit = index * WORD_BITS + word.trailing_zeros() as usize;
                return bit.min(end);
            }
            index += 1;
            if index * WORD_BITS >= end {
                return end;
            }
            word = self.words[index] ^ flip;
        }
    }

    /// Last set bit in `[start, end)`.
    pub fn find_last_bit(&self, start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.nbits);
        if start >= end {
            return None;
        }
        let mut index = word_index(end - 1);
        loop {
            let word = self.words[index] & range_mask(index, start, end);
            if word != 0 {
                let bit = index * WORD_BITS + (WORD_BITS - 1 - word.leading_zeros() as usize);
                return Some(bit);
            }
            if index == word_index(start) {
                return None;
            }
            index -= 1;
        }
    }

    /// First run of `nr` clear bits at or after `start` whose first bit is a
    /// multiple of `align_mask + 1`.
    pub fn find_next_zero_area(&self, start: usize, nr: usize, align_mask: usize) -> Option<usize> {
        let mut start = start;
        loop {
            let index = self.find_next_zero_bit(start, self.nbits);
            let index = (index + align_mask) & !align_mask;
            let end = index + nr;
            if end > self.nbits {
                return None;
            }
            let busy = self.find_next_bit(index, end);
            if busy >= end {
                return Some(index);
            }
            start = busy + 1;
        }
    }

    /// Number of set bits in `[start, end)`.
    pub fn weight(&self, start: usize, end: usize) -> usize {
        let end = end.min(self.nbits);
        if start >= end {
            return 0;
        }
        (word_index(start)..=word_index(end - 1))
            .map(|index| (self.words[index] & range_mask(index, start, end)).count_ones() as usize)
            .sum()
    }

    /// Next maximal run of clear bits inside `[start, end)`.
    pub fn next_zero_region(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let rs = self.find_next_zero_bit(start, end);
        if rs >= end {
            return None;
        }
        Some((rs, self.find_next_bit(rs + 1, end)))
    }

    /// Next maximal run of set bits inside `[start, end)`.
    pub fn next_set_region(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let rs = self.find_next_bit(start, end);
        if rs >= end {
            return None;
        }
        Some((rs, self.find_next_zero_bit(rs + 1, end)))
    }

    /// All maximal clear runs inside `[start, end)`, in order.
    pub fn zero_regions(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut regions = Vec::new();
        let mut pos = start;
        while let Some((rs, re)) = self.next_zero_region(pos, end) {
            regions.push((rs, re));
            pos = re + 1;
        }
        regions
    }

    /// All maximal set runs inside `[start, end)`, in order.
    pub fn set_regions(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut regions = Vec::new();
        let mut pos = start;
        while let Some((rs, re)) = self.next_set_region(pos, end) {
            regions.push((rs, re));
            pos = re + 1;
        }
        regions
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("nbits", &self.nbits)
            .field("weight", &self.weight(0, self.nbits))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_ops_cross_words() {
        let mut map = Bitmap::new(200);
        map.set_range(60, 10);
        assert_eq!(map.weight(0, 200), 10);
        assert!(!map.test(59));
        assert!(map.test(60));
        assert!(map.test(69));
        assert!(!map.test(70));

        map.clear_range(62, 3);
        assert_eq!(map.weight(0, 200), 7);
        assert_eq!(map.weight(60, 64), 2);

        map.fill();
        assert_eq!(map.weight(0, 200), 200);
        assert_eq!(map.find_next_zero_bit(0, 200), 200);
    }

    #[test]
    fn test_find_next_and_last() {
        let mut map = Bitmap::new(300);
        map.set(5);
        map.set(128);
        map.set(299);

        assert_eq!(map.find_next_bit(0, 300), 5);
        assert_eq!(map.find_next_bit(6, 300), 128);
        assert_eq!(map.find_next_bit(129, 299), 299);
        assert_eq!(map.find_next_bit(129, 300), 299);
        assert_eq!(map.find_next_bit(300, 300), 300);
        assert_eq!(map.find_next_bit(301, 300), 300);

        assert_eq!(map.find_next_zero_bit(5, 300), 6);

        assert_eq!(map.find_last_bit(0, 128), Some(5));
        assert_eq!(map.find_last_bit(0, 129), Some(128));
        assert_eq!(map.find_last_bit(6, 128), None);
        assert_eq!(map.find_last_bit(0, 300), Some(299));
        assert_eq!(map.find_last_bit(0, 0), None);
    }

    #[test]
    fn test_zero_area_alignment() {
        let mut map = Bitmap::new(64);
        map.fill();
        map.clear_range(5, 7);

        assert_eq!(map.find_next_zero_area(0, 3, 0), Some(5));
        assert_eq!(map.find_next_zero_area(0, 3, 7), Some(8));
        assert_eq!(map.find_next_zero_area(0, 5, 7), None);
        assert_eq!(map.find_next_zero_area(0, 7, 0), Some(5));
        assert_eq!(map.find_next_zero_area(0, 8, 0), None);
    }

    #[test]
    fn test_regions() {
        let mut map = Bitmap::new(16);
        map.set_range(2, 3);
        map.set_range(10, 6);

        assert_eq!(map.set_regions(0, 16), vec![(2, 5), (10, 16)]);
        assert_eq!(map.zero_regions(0, 16), vec![(0, 2), (5, 10)]);
        assert_eq!(map.zero_regions(3, 12), vec![(5, 10)]);
        assert_eq!(map.set_regions(3, 12), vec![(3, 5), (10, 12)]);
    }
}
