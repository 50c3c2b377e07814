//! Fixed-capacity block allocator.
//!
//! A bitmap of `capacity` blocks. The B-link tree uses one per index file
//! for node pages; the file store uses one per kind for data file ids.

use crate::error::{FsResult, StorageFault};

/// Bitmap allocator over blocks `0..capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocator {
    words: Vec<u64>,
    capacity: u64,
    used: u64,
    next_hint: u64,
}

impl BlockAllocator {
    /// Creates an allocator with every block free.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let words = vec![0u64; capacity.div_ceil(64) as usize];
        Self {
            words,
            capacity,
            used: 0,
            next_hint: 0,
        }
    }

    /// Number of blocks managed.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of allocated blocks.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Returns true if `block` is allocated.
    #[must_use]
    pub fn is_allocated(&self, block: u64) -> bool {
        block < self.capacity && self.words[(block / 64) as usize] & (1 << (block % 64)) != 0
    }

    /// Allocates the first free block at or after the last allocation,
    /// wrapping around.
    ///
    /// # Errors
    ///
    /// Returns `AllocatorExhausted` when every block is in use.
    pub fn allocate(&mut self) -> FsResult<u64> {
        if self.used >= self.capacity {
            return Err(StorageFault::AllocatorExhausted {
                capacity: self.capacity,
            });
        }
        let block = self
            .scan(self.next_hint, self.capacity)
            .or_else(|| self.scan(0, self.next_hint))
            .ok_or(StorageFault::AllocatorExhausted {
                capacity: self.capacity,
            })?;
        self.set(block);
        self.next_hint = block + 1;
        Ok(block)
    }

    /// Raises the capacity. Never shrinks.
    pub fn grow(&mut self, capacity: u64) {
        if capacity > self.capacity {
            self.words.resize(capacity.div_ceil(64) as usize, 0);
            self.capacity = capacity;
        }
    }

    /// Marks a specific block as allocated. Marking twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `block` is out of range.
    pub fn mark(&mut self, block: u64) -> FsResult<()> {
        if block >= self.capacity {
            return Err(StorageFault::invalid_operation(format!(
                "block {block} outside allocator of {} blocks",
                self.capacity
            )));
        }
        if !self.is_allocated(block) {
            self.set(block);
        }
        Ok(())
    }

    /// Frees a block. Freeing a free block is a no-op.
    pub fn free(&mut self, block: u64) {
        if self.is_allocated(block) {
            self.words[(block / 64) as usize] &= !(1 << (block % 64));
            self.used -= 1;
            if block < self.next_hint {
                self.next_hint = block;
            }
        }
    }

    /// Iterates allocated blocks in ascending order.
    pub fn allocated(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64u64)
                .filter(move |bit| w & (1 << bit) != 0)
                .map(move |bit| i as u64 * 64 + bit)
        })
    }

    /// Serializes the bitmap as little-endian words prefixed by the capacity.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.words.len() * 8);
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        for w in &self.words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf
    }

    /// Restores an allocator written by [`BlockAllocator::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the length disagrees with the stored capacity.
    pub fn from_bytes(buf: &[u8]) -> FsResult<Self> {
        let mut r = crate::codec::ByteReader::new(buf, "allocator bitmap");
        let capacity = r.u64()?;
        let n = capacity.div_ceil(64) as usize;
        if r.remaining() != n * 8 {
            return Err(StorageFault::corrupted(format!(
                "allocator of {capacity} blocks needs {} bitmap bytes, found {}",
                n * 8,
                r.remaining()
            )));
        }
        let mut words = Vec::with_capacity(n);
        for _ in 0..n {
            words.push(r.u64()?);
        }
        if let Some(last) = words.last_mut() {
            let tail = capacity % 64;
            if tail != 0 {
                *last &= (1u64 << tail) - 1;
            }
        }
        let used = words.iter().map(|w| u64::from(w.count_ones())).sum();
        Ok(Self {
            words,
            capacity,
            used,
            next_hint: 0,
        })
    }

    fn set(&mut self, block: u64) {
        self.words[(block / 64) as usize] |= 1 << (block % 64);
        self.used += 1;
    }

    fn scan(&self, from: u64, to: u64) -> Option<u64> {
        let mut block = from;
        while block < to {
            let word = self.words[(block / 64) as usize];
            if word == u64::MAX {
                block = (block / 64 + 1) * 64;
                continue;
            }
            if word & (1 << (block % 64)) == 0 {
                return Some(block);
            }
            block += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequentially() {
        let mut a = BlockAllocator::new(130);
        for expected in 0..130 {
            assert_eq!(a.allocate().unwrap(), expected);
        }
        assert_eq!(a.used(), 130);
        assert!(matches!(
            a.allocate(),
            Err(StorageFault::AllocatorExhausted { capacity: 130 })
        ));
    }

    #[test]
    fn reuses_freed_blocks() {
        let mut a = BlockAllocator::new(8);
        for _ in 0..8 {
            a.allocate().unwrap();
        }
        a.free(3);
        a.free(3);
        assert_eq!(a.used(), 7);
        assert_eq!(a.allocate().unwrap(), 3);
    }

    #[test]
    fn mark_and_iterate() {
        let mut a = BlockAllocator::new(200);
        a.mark(5).unwrap();
        a.mark(150).unwrap();
        a.mark(150).unwrap();
        assert!(a.mark(200).is_err());
        assert_eq!(a.allocated().collect::<Vec<_>>(), [5, 150]);
        assert_eq!(a.used(), 2);
        assert_eq!(a.allocate().unwrap(), 0);
    }

    #[test]
    fn grow_adds_free_blocks() {
        let mut a = BlockAllocator::new(2);
        a.allocate().unwrap();
        a.allocate().unwrap();
        assert!(a.allocate().is_err());
        a.grow(100);
        a.grow(10);
        assert_eq!(a.capacity(), 100);
        assert_eq!(a.allocate().unwrap(), 2);
    }

    #[test]
    fn bitmap_persists() {
        let mut a = BlockAllocator::new(70);
        a.mark(1).unwrap();
        a.mark(69).unwrap();
        let b = BlockAllocator::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(b.allocated().collect::<Vec<_>>(), [1, 69]);
        assert_eq!(b.used(), 2);
        assert!(BlockAllocator::from_bytes(&a.to_bytes()[..12]).is_err());
    }
}
