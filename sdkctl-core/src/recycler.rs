//! Fixed-size block pool for short-lived protocol buffers.
//!
//! One recycler belongs to one `SdkCtlSocket`. Requests up to the block
//! size are served from the pool (or a fresh block of exactly the block
//! size); larger requests bypass it. Only blocks of the configured size
//! go back to the pool, and only while it holds fewer than `max` blocks.

use bytes::BytesMut;

#[derive(Debug, Default)]
pub struct Recycler {
    block_size: usize,
    max: usize,
    pool: Vec<BytesMut>,
    fresh: usize,
}

impl Recycler {
    pub fn new(block_size: usize, max: usize) -> Self {
        Self {
            block_size,
            max,
            pool: Vec::with_capacity(max),
            fresh: 0,
        }
    }

    /// A recycler that pools nothing: every allocation is fresh and every
    /// free drops the block.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.block_size > 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of blocks waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Number of allocations that could not be served from the pool.
    pub fn fresh_allocations(&self) -> usize {
        self.fresh
    }

    /// Allocate a zero-filled buffer of `size` bytes.
    pub fn alloc(&mut self, size: usize) -> BytesMut {
        let mut block = if self.is_configured() && size <= self.block_size {
            match self.pool.pop() {
                Some(block) => block,
                None => {
                    self.fresh += 1;
                    BytesMut::with_capacity(self.block_size)
                }
            }
        } else {
            self.fresh += 1;
            BytesMut::with_capacity(size)
        };
        block.resize(size, 0);
        block
    }

    /// Return a block. Blocks of a foreign size are simply dropped.
    pub fn free(&mut self, mut block: BytesMut) {
        if self.is_configured()
            && block.capacity() == self.block_size
            && self.pool.len() < self.max
        {
            block.clear();
            self.pool.push(block);
        }
    }

    /// Drop every pooled block.
    pub fn clear(&mut self) {
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_freed_blocks() {
        let mut recycler = Recycler::new(64, 4);
        let blocks: Vec<_> = (0..4).map(|_| recycler.alloc(32)).collect();
        assert_eq!(recycler.fresh_allocations(), 4);

        for block in blocks {
            recycler.free(block);
        }
        assert_eq!(recycler.pooled(), 4);

        let again: Vec<_> = (0..4).map(|_| recycler.alloc(64)).collect();
        assert_eq!(recycler.fresh_allocations(), 4);
        assert!(again.iter().all(|b| b.len() == 64));
    }

    #[test]
    fn pool_is_bounded() {
        let n = 10;
        let max = 3;
        let mut recycler = Recycler::new(16, max);
        let blocks: Vec<_> = (0..n).map(|_| recycler.alloc(16)).collect();
        for block in blocks {
            recycler.free(block);
        }
        assert_eq!(recycler.pooled(), max);

        let before = recycler.fresh_allocations();
        let _second: Vec<_> = (0..n).map(|_| recycler.alloc(16)).collect();
        assert_eq!(recycler.fresh_allocations() - before, n - max);
    }

    #[test]
    fn oversized_requests_bypass_pool() {
        let mut recycler = Recycler::new(16, 8);
        let big = recycler.alloc(100);
        assert_eq!(big.len(), 100);
        recycler.free(big);
        assert_eq!(recycler.pooled(), 0);
    }

    #[test]
    fn recycled_blocks_are_zeroed() {
        let mut recycler = Recycler::new(8, 1);
        let mut block = recycler.alloc(8);
        block.copy_from_slice(b"garbage!");
        recycler.free(block);

        let block = recycler.alloc(4);
        assert_eq!(&block[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn disabled_recycler_never_pools() {
        let mut recycler = Recycler::disabled();
        let block = recycler.alloc(8);
        recycler.free(block);
        assert_eq!(recycler.pooled(), 0);
        assert_eq!(recycler.fresh_allocations(), 1);
    }

    #[test]
    fn clear_empties_pool() {
        let mut recycler = Recycler::new(8, 4);
        let block = recycler.alloc(8);
        recycler.free(block);
        recycler.clear();
        assert_eq!(recycler.pooled(), 0);
    }
}
