//! Block manager: front door to the allocator and the prefix cache.
//!
//! Sequences get their blocks through here. Allocation consults the prefix
//! cache first (shared blocks for a previously seen prompt), then the free
//! list, and under pressure evicts unreferenced cache entries before giving
//! up. Released sequences donate their computed prefix back to the cache.

use tracing::warn;

use crate::core::block::{blocks_needed, BlockAllocator};
use crate::core::prefix_cache::PrefixCache;
use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// Coordinates the block allocator and the prefix cache for sequences.
pub struct BlockManager {
    block_size: usize,
    allocator: BlockAllocator,
    prefix_cache: Option<PrefixCache>,
}

impl BlockManager {
    /// Create a manager over `num_blocks` blocks with the prefix cache
    /// enabled.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self::with_prefix_cache(num_blocks, block_size, true)
    }

    /// Create a manager with an explicit prefix-cache switch.
    pub fn with_prefix_cache(num_blocks: usize, block_size: usize, enable: bool) -> Self {
        Self {
            block_size,
            allocator: BlockAllocator::new(num_blocks, block_size),
            prefix_cache: enable.then(|| PrefixCache::new(block_size)),
        }
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of physical blocks.
    pub fn num_blocks(&self) -> usize {
        self.allocator.num_blocks()
    }

    /// Blocks on the allocator free list.
    pub fn free_count(&self) -> usize {
        self.allocator.free_count()
    }

    /// Blocks held by the prefix cache.
    pub fn num_cached_blocks(&self) -> usize {
        self.prefix_cache
            .as_ref()
            .map_or(0, |cache| cache.num_blocks())
    }

    /// Ensure `seq` owns enough blocks to hold `target_tokens` tokens of KV
    /// state.
    ///
    /// A sequence without blocks is first bootstrapped from the prefix
    /// cache: shared blocks matching its prompt are adopted and the KV
    /// cursor fast-forwards over them (stopping one token short when the
    /// whole prompt is cached). Fresh blocks are then allocated for the
    /// remainder, evicting unreferenced cache entries if the free list runs
    /// short.
    ///
    /// All-or-nothing: on error the sequence keeps exactly the blocks and
    /// cursor it had, so the caller can preempt and retry safely.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] when the shortfall cannot be covered
    /// even after cache eviction.
    pub fn allocate_for(&mut self, seq: &mut Sequence, target_tokens: usize) -> Result<()> {
        let kv_before = seq.num_kv_cache_tokens();
        let mut kv_after = kv_before;

        let mut shared = Vec::new();
        if seq.num_blocks() == 0 {
            if let Some(cache) = self.prefix_cache.as_mut() {
                let prompt = &seq.token_ids()[..seq.num_prompt_tokens()];
                shared = cache.match_prefix(prompt);
                if !shared.is_empty() {
                    kv_after = shared.len() * self.block_size;
                    if kv_after == seq.num_prompt_tokens() {
                        kv_after -= 1;
                    }
                }
            }
        }

        // the token budget rides on top of whatever the bootstrap covered
        let budget = target_tokens.saturating_sub(kv_before);
        let target = (kv_after + budget).min(seq.num_tokens());

        let owned = seq.num_blocks() + shared.len();
        let needed = blocks_needed(target, self.block_size);
        if needed > owned {
            let additional = needed - owned;
            self.reserve(additional)?;
            let fresh = self
                .allocator
                .allocate(additional)
                .map_err(|_| Error::OutOfMemory)?;
            if !shared.is_empty() {
                seq.append_shared_blocks(shared);
            }
            seq.append_blocks(fresh);
        } else if !shared.is_empty() {
            seq.append_shared_blocks(shared);
        }
        Ok(())
    }

    /// Make sure `additional` blocks are allocatable, evicting from the
    /// prefix cache if the free list is short.
    fn reserve(&mut self, additional: usize) -> Result<()> {
        if self.allocator.can_allocate(additional) {
            return Ok(());
        }
        let Some(cache) = self.prefix_cache.as_mut() else {
            return Err(Error::OutOfMemory);
        };

        let shortfall = additional - self.allocator.free_count();
        let evicted = cache.evict(shortfall);
        if evicted < shortfall {
            return Err(Error::OutOfMemory);
        }
        if !self.allocator.can_allocate(additional) {
            warn!(
                free_blocks = self.allocator.free_count(),
                cached_blocks = cache.num_blocks(),
                "potential block leak: eviction did not refill the free list"
            );
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    /// Release a sequence's blocks, donating its computed prefix to the
    /// prefix cache first. Unshared blocks return to the free list as the
    /// sequence's handles drop.
    pub fn release(&mut self, seq: &mut Sequence) {
        if let Some(cache) = self.prefix_cache.as_mut() {
            cache.insert(seq.tokens_in_kv_cache(), seq.blocks());
        }
        seq.release_blocks();
    }

    /// Publish a sequence's prompt blocks to the prefix cache without
    /// releasing them, so sibling sequences can share the prompt's KV
    /// state while this sequence keeps generating.
    pub fn cache_prompt(&mut self, seq: &Sequence) {
        if let Some(cache) = self.prefix_cache.as_mut() {
            let cached_len = seq.tokens_in_kv_cache().len();
            let prompt_len = seq.num_prompt_tokens().min(cached_len);
            cache.insert(&seq.token_ids()[..prompt_len], seq.blocks());
        }
    }

    /// Release a cancelled sequence's blocks, keeping only the prompt
    /// portion in the prefix cache. Generated tokens of a cancelled
    /// request are not worth caching.
    pub fn release_prompt_only(&mut self, seq: &mut Sequence) {
        self.cache_prompt(seq);
        seq.release_blocks();
    }

    /// Whether a fresh sequence's prompt is already fully covered by cached
    /// blocks (only possible for block-aligned prompts).
    pub fn prompt_fully_cached(&self, seq: &Sequence) -> bool {
        let prompt = &seq.token_ids()[..seq.num_prompt_tokens()];
        self.prefix_cache
            .as_ref()
            .is_some_and(|cache| cache.lookup_len(prompt) >= prompt.len())
    }
}

impl std::fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager")
            .field("block_size", &self.block_size)
            .field("free_blocks", &self.free_count())
            .field("cached_blocks", &self.num_cached_blocks())
            .finish()
    }
}
