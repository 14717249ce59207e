//! Chunk bitmap: which chunk indices of a session are done.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    len: u32,
    words: Vec<u64>,
    set_count: u32,
}

impl ChunkBitmap {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; (len as usize).div_ceil(64)],
            set_count: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `index`. Returns true if it was not set before; out-of-range is ignored.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.set_count += 1;
        true
    }

    pub fn contains(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.set_count
    }

    pub fn is_complete(&self) -> bool {
        self.set_count == self.len
    }

    /// Unset indices, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.len).filter(|&i| !self.contains(i)).collect()
    }

    /// Set indices, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.contains(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_first_time_only() {
        let mut b = ChunkBitmap::new(130);
        assert!(b.set(0));
        assert!(b.set(129));
        assert!(!b.set(129));
        assert!(!b.set(130));
        assert_eq!(b.count(), 2);
        assert!(b.contains(129));
        assert!(!b.contains(64));
    }

    #[test]
    fn missing_lists_gaps_in_order() {
        let mut b = ChunkBitmap::new(5);
        b.set(1);
        b.set(3);
        assert_eq!(b.missing(), vec![0, 2, 4]);
        assert_eq!(b.iter_set().collect::<Vec<_>>(), vec![1, 3]);
        for i in [0, 2, 4] {
            b.set(i);
        }
        assert!(b.is_complete());
        assert!(b.missing().is_empty());
    }

    #[test]
    fn empty_bitmap_is_complete() {
        let b = ChunkBitmap::new(0);
        assert!(b.is_empty());
        assert!(b.is_complete());
    }
}
