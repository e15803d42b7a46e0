//! Per-sample "missing" bits.

use std::ops::Range;

/// Fixed-length bitset; a set bit marks a sample that is not present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleFlags {
    words: Vec<u64>,
    len: usize,
}

impl SampleFlags {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Resize to `len` samples and clear every bit.
    pub fn reset(&mut self, len: usize) {
        self.words.clear();
        self.words.resize(len.div_ceil(64), 0);
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 64] |= 1 << (index % 64);
    }

    pub fn set_range(&mut self, range: Range<usize>) {
        for i in range.start..range.end.min(self.len) {
            self.set(i);
        }
    }

    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Number of flagged samples.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// No sample is flagged.
    pub fn none_set(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Maximal runs of flagged samples, in order.
    pub fn ranges(&self) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        let mut start = None;
        for i in 0..self.len {
            match (self.is_set(i), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    out.push(s..i);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            out.push(s..self.len);
        }
        out
    }
}
