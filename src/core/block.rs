//! Block handles and the physical block allocator.
//!
//! The KV cache is divided into fixed-size physical blocks, handed out as
//! reference-counted [`Block`] handles. Dropping the last handle for a
//! physical block returns its id to the allocator's free list, so block
//! accounting follows ownership: a sequence or prefix-cache node holds a
//! block alive exactly as long as it holds the handle.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Shared pool state behind the allocator and every live handle.
struct Pool {
    /// Free physical ids, LIFO for locality.
    free: Mutex<Vec<u32>>,
    /// Tokens per block.
    block_size: usize,
    /// Total number of physical blocks.
    num_blocks: usize,
}

/// The uniquely-owned part of a block handle. On drop the physical id
/// goes back to the pool's free list.
struct BlockInner {
    id: u32,
    pool: Arc<Pool>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.id);
    }
}

/// A reference-counted handle to one physical KV cache block.
///
/// Cloning the handle shares the block (`ref_count` goes up); the block is
/// "shared" whenever more than one handle is alive. The physical slab is
/// reclaimed when the last handle drops.
pub struct Block {
    inner: Arc<BlockInner>,
}

impl Block {
    /// Physical block id in `[0, num_blocks)`.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Tokens per block.
    pub fn size(&self) -> usize {
        self.inner.pool.block_size
    }

    /// Number of live handles for this physical block.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// A block is shared iff more than one handle is alive.
    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Flat slot id of `offset` within this block.
    ///
    /// Slot ids address single-token positions across the whole pool:
    /// `slot = block_id * block_size + offset`.
    pub fn slot(&self, offset: usize) -> i32 {
        debug_assert!(offset < self.size());
        self.inner.id as i32 * self.size() as i32 + offset as i32
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Free-list allocator over a fixed set of physical blocks.
///
/// # Example
///
/// ```
/// use infercore::core::block::BlockAllocator;
///
/// let allocator = BlockAllocator::new(8, 16);
/// let blocks = allocator.allocate(3).unwrap();
/// assert_eq!(allocator.free_count(), 5);
///
/// drop(blocks);
/// assert_eq!(allocator.free_count(), 8);
/// ```
pub struct BlockAllocator {
    pool: Arc<Pool>,
}

impl BlockAllocator {
    /// Create an allocator with `num_blocks` blocks of `block_size` tokens.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        let free: Vec<u32> = (0..num_blocks as u32).rev().collect();
        Self {
            pool: Arc::new(Pool {
                free: Mutex::new(free),
                block_size,
                num_blocks,
            }),
        }
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.pool.block_size
    }

    /// Total number of physical blocks.
    pub fn num_blocks(&self) -> usize {
        self.pool.num_blocks
    }

    /// Number of blocks currently on the free list.
    pub fn free_count(&self) -> usize {
        self.pool.free.lock().len()
    }

    /// Check whether `count` blocks can be allocated right now.
    pub fn can_allocate(&self, count: usize) -> bool {
        self.free_count() >= count
    }

    /// Allocate `count` fresh blocks, each with a single handle.
    ///
    /// The allocation is all-or-nothing: if fewer than `count` blocks are
    /// free, no block is taken.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] when the free list is too short.
    pub fn allocate(&self, count: usize) -> Result<Vec<Block>> {
        let mut free = self.pool.free.lock();
        if free.len() < count {
            return Err(Error::OutOfBlocks);
        }
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let id = free.pop().ok_or(Error::OutOfBlocks)?;
            blocks.push(Block {
                inner: Arc::new(BlockInner {
                    id,
                    pool: Arc::clone(&self.pool),
                }),
            });
        }
        Ok(blocks)
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("num_blocks", &self.num_blocks())
            .field("block_size", &self.block_size())
            .field("free_count", &self.free_count())
            .finish()
    }
}

/// Compute the number of blocks needed to cover `num_tokens` tokens.
pub fn blocks_needed(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}
