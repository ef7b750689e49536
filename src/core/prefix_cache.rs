//! Prefix cache: block-granular KV reuse across requests.
//!
//! A radix tree keyed by token-id sequences remembers which [`Block`]s hold
//! the KV state for which prefixes. A new request sharing a leading
//! sub-sequence with a past one picks up the already-computed blocks instead
//! of re-running prefill. Only whole blocks are cached or matched; partial
//! blocks are never safely reusable.
//!
//! Nodes live in an arena (`Vec` indexed by [`NodeId`]) with parent/child
//! links stored as indices, which sidesteps ownership cycles and keeps LRU
//! traversal trivial.

use crate::core::block::Block;

/// Index of a node in the arena.
type NodeId = usize;

/// The root occupies slot 0 and carries no tokens.
const ROOT: NodeId = 0;

/// Length of the common prefix of two token slices.
fn common_prefix_len(a: &[i32], b: &[i32]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Round `n` down to a multiple of `multiple`.
fn round_down(n: usize, multiple: usize) -> usize {
    (n / multiple) * multiple
}

struct Node {
    /// Tokens this node covers; `token_ids.len() == blocks.len() * block_size`
    /// for every non-root node.
    token_ids: Vec<i32>,
    /// Blocks holding the KV state for `token_ids`.
    blocks: Vec<Block>,
    /// Child node ids. Siblings never share a non-empty token prefix.
    children: Vec<NodeId>,
    /// Parent node id; `ROOT` is its own parent.
    parent: NodeId,
    /// Logical time of the last match/insert touching this node.
    last_access: u64,
    /// Logical creation time, breaks LRU ties (older evicts first).
    created: u64,
}

impl Node {
    fn vacant() -> Self {
        Self {
            token_ids: Vec::new(),
            blocks: Vec::new(),
            children: Vec::new(),
            parent: ROOT,
            last_access: 0,
            created: 0,
        }
    }
}

/// A radix tree of cached KV prefixes with LRU eviction.
///
/// # Example
///
/// ```
/// use infercore::core::block::BlockAllocator;
/// use infercore::core::prefix_cache::PrefixCache;
///
/// let allocator = BlockAllocator::new(8, 4);
/// let mut cache = PrefixCache::new(4);
///
/// let blocks = allocator.allocate(1).unwrap();
/// cache.insert(&[1, 2, 3, 4], &blocks);
/// drop(blocks);
///
/// // The block lives on inside the cache and matches again.
/// let matched = cache.match_prefix(&[1, 2, 3, 4, 5]);
/// assert_eq!(matched.len(), 1);
/// ```
pub struct PrefixCache {
    nodes: Vec<Node>,
    free_slots: Vec<NodeId>,
    block_size: usize,
    /// Total blocks held by non-root nodes.
    num_blocks: usize,
    /// Live non-root nodes.
    num_nodes: usize,
    /// Logical clock driving LRU ordering.
    clock: u64,
}

impl PrefixCache {
    /// Create an empty cache for blocks of `block_size` tokens.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be greater than 0");
        Self {
            nodes: vec![Node::vacant()],
            free_slots: Vec::new(),
            block_size,
            num_blocks: 0,
            num_nodes: 0,
            clock: 0,
        }
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks held by the cache.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Number of non-root nodes in the tree.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Match `token_ids` against the tree and return handles for every
    /// cached block covering the longest common block-aligned prefix.
    ///
    /// Returned handles are clones: their blocks stay pinned (shared) for
    /// as long as the caller holds them. Every matched node's last-access
    /// time is refreshed.
    pub fn match_prefix(&mut self, token_ids: &[i32]) -> Vec<Block> {
        let now = self.tick();
        let mut query = &token_ids[..round_down(token_ids.len(), self.block_size)];

        let mut matched = Vec::new();
        let mut cursor = Some(ROOT);
        while let Some(curr) = cursor.take() {
            if query.is_empty() {
                break;
            }
            let children = self.nodes[curr].children.clone();
            for child_id in children {
                let prefix_len = round_down(
                    common_prefix_len(query, &self.nodes[child_id].token_ids),
                    self.block_size,
                );
                if prefix_len == 0 {
                    continue;
                }
                let child = &mut self.nodes[child_id];
                child.last_access = now;

                let n_blocks = prefix_len / self.block_size;
                matched.extend(child.blocks[..n_blocks].iter().cloned());
                let full_match = prefix_len == child.token_ids.len();
                query = &query[prefix_len..];

                if full_match {
                    // descend to grandchildren
                    cursor = Some(child_id);
                }
                break;
            }
        }
        matched
    }

    /// Length of the longest cached block-aligned prefix of `token_ids`.
    ///
    /// Read-only probe: no handles are cloned and no access times move.
    pub fn lookup_len(&self, token_ids: &[i32]) -> usize {
        let mut query = &token_ids[..round_down(token_ids.len(), self.block_size)];

        let mut matched_tokens = 0;
        let mut cursor = Some(ROOT);
        while let Some(curr) = cursor.take() {
            if query.is_empty() {
                break;
            }
            for &child_id in &self.nodes[curr].children {
                let prefix_len = round_down(
                    common_prefix_len(query, &self.nodes[child_id].token_ids),
                    self.block_size,
                );
                if prefix_len == 0 {
                    continue;
                }
                matched_tokens += prefix_len;
                let full_match = prefix_len == self.nodes[child_id].token_ids.len();
                query = &query[prefix_len..];
                if full_match {
                    cursor = Some(child_id);
                }
                break;
            }
        }
        matched_tokens
    }

    /// Insert `token_ids` and the blocks backing them into the tree.
    ///
    /// Only whole-block suffixes are cached: the input is truncated to
    /// `min(token_ids.len() / B, blocks.len())` blocks. Nodes are split on
    /// partial matches so that siblings never share a non-empty prefix.
    /// Returns the number of newly cached tokens, excluding overlap with
    /// prefixes already present.
    pub fn insert(&mut self, token_ids: &[i32], blocks: &[Block]) -> usize {
        let now = self.tick();
        let n_blocks = (token_ids.len() / self.block_size).min(blocks.len());
        let mut query = &token_ids[..n_blocks * self.block_size];
        let mut remaining_blocks = &blocks[..n_blocks];

        let mut new_tokens = 0;
        let mut cursor = Some(ROOT);
        while let Some(curr) = cursor.take() {
            if query.is_empty() {
                break;
            }
            let children = self.nodes[curr].children.clone();
            let mut descend = None;
            for child_id in children {
                let prefix_len = round_down(
                    common_prefix_len(query, &self.nodes[child_id].token_ids),
                    self.block_size,
                );
                if prefix_len > 0 {
                    descend = Some((child_id, prefix_len));
                    break;
                }
            }

            match descend {
                Some((child_id, prefix_len)) => {
                    self.nodes[child_id].last_access = now;
                    query = &query[prefix_len..];
                    remaining_blocks = &remaining_blocks[prefix_len / self.block_size..];

                    if prefix_len < self.nodes[child_id].token_ids.len() {
                        // partial match: split so the common prefix stays in
                        // place and the tail becomes a child
                        self.split_node(child_id, prefix_len);
                    }
                    cursor = Some(child_id);
                }
                None => {
                    // no child shares a block-aligned prefix; the rest of the
                    // input becomes a new leaf
                    self.create_child(curr, query, remaining_blocks, now);
                    new_tokens += query.len();
                }
            }
        }
        new_tokens
    }

    /// Evict up to `n_blocks` unshared blocks, least-recently-used leaves
    /// first, and return how many were actually reclaimed.
    ///
    /// Blocks still referenced outside the cache are pinned and never
    /// evicted; a cache whose blocks are all shared reclaims nothing.
    pub fn evict(&mut self, n_blocks: usize) -> usize {
        let mut total_evicted = 0;
        // removing a leaf can expose its parent as the next victim, so scan
        // in rounds until the quota is met or a round makes no progress
        while total_evicted < n_blocks {
            let evicted = self.evict_round(n_blocks - total_evicted);
            if evicted == 0 {
                break;
            }
            total_evicted += evicted;
        }
        total_evicted
    }

    fn evict_round(&mut self, n_blocks: usize) -> usize {
        let mut leaves = self.collect_leaves();
        leaves.sort_by_key(|&id| (self.nodes[id].last_access, self.nodes[id].created, id));

        let mut evicted = 0;
        let mut empty_leaves = Vec::new();
        for leaf_id in leaves {
            if evicted >= n_blocks {
                break;
            }
            let block_size = self.block_size;
            let node = &mut self.nodes[leaf_id];
            let total = node.blocks.len();
            // shared blocks form a prefix (sharing is prefix-based); only the
            // unshared tail is reclaimable
            let pinned = node.blocks.iter().take_while(|b| b.is_shared()).count();
            let n_to_evict = (n_blocks - evicted).min(total - pinned);
            if n_to_evict == 0 {
                continue;
            }
            evicted += n_to_evict;
            if n_to_evict == total {
                empty_leaves.push(leaf_id);
            } else {
                let blocks_left = total - n_to_evict;
                node.token_ids.truncate(blocks_left * block_size);
                node.blocks.truncate(blocks_left);
            }
        }

        for leaf_id in empty_leaves {
            self.remove_leaf(leaf_id);
        }
        self.num_blocks -= evicted;
        evicted
    }

    // ---- internal tree surgery ----

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        self.num_nodes += 1;
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Split `node_id` at `prefix_len`: the prefix stays in place, the tail
    /// moves into a new child that inherits the old children.
    fn split_node(&mut self, node_id: NodeId, prefix_len: usize) {
        debug_assert!(prefix_len > 0 && prefix_len % self.block_size == 0);
        debug_assert!(prefix_len < self.nodes[node_id].token_ids.len());
        let n_blocks = prefix_len / self.block_size;

        let node = &mut self.nodes[node_id];
        let tail_tokens = node.token_ids.split_off(prefix_len);
        let tail_blocks = node.blocks.split_off(n_blocks);
        let inherited_children = std::mem::take(&mut node.children);
        let last_access = node.last_access;
        let created = node.created;

        let tail_id = self.alloc_node(Node {
            token_ids: tail_tokens,
            blocks: tail_blocks,
            children: inherited_children,
            parent: node_id,
            last_access,
            created,
        });
        for i in 0..self.nodes[tail_id].children.len() {
            let grand_child = self.nodes[tail_id].children[i];
            self.nodes[grand_child].parent = tail_id;
        }
        self.nodes[node_id].children.push(tail_id);
    }

    fn create_child(&mut self, parent: NodeId, tokens: &[i32], blocks: &[Block], now: u64) {
        debug_assert!(!tokens.is_empty());
        debug_assert_eq!(tokens.len(), blocks.len() * self.block_size);
        self.num_blocks += blocks.len();
        let child_id = self.alloc_node(Node {
            token_ids: tokens.to_vec(),
            blocks: blocks.to_vec(),
            children: Vec::new(),
            parent,
            last_access: now,
            created: now,
        });
        self.nodes[parent].children.push(child_id);
    }

    fn remove_leaf(&mut self, leaf_id: NodeId) {
        debug_assert_ne!(leaf_id, ROOT);
        debug_assert!(self.nodes[leaf_id].children.is_empty());
        let parent = self.nodes[leaf_id].parent;
        self.nodes[parent].children.retain(|&c| c != leaf_id);
        // dropping the node's blocks returns any unshared ones to the pool
        self.nodes[leaf_id] = Node::vacant();
        self.free_slots.push(leaf_id);
        self.num_nodes -= 1;
    }

    /// Live leaves reachable from the root (the root itself never counts).
    fn collect_leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.children.is_empty() {
                if id != ROOT {
                    leaves.push(id);
                }
            } else {
                stack.extend_from_slice(&node.children);
            }
        }
        leaves
    }

    /// Walk the tree and check structural invariants. Test-only.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut total_blocks = 0;
        let mut total_nodes = 0;
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if id != ROOT {
                total_nodes += 1;
                total_blocks += node.blocks.len();
                assert!(!node.token_ids.is_empty());
                assert_eq!(node.token_ids.len(), node.blocks.len() * self.block_size);
            }
            for (i, &a) in node.children.iter().enumerate() {
                for &b in &node.children[i + 1..] {
                    // siblings must be disjoint at block granularity: a
                    // shared sub-block run is invisible to the matcher
                    let common =
                        common_prefix_len(&self.nodes[a].token_ids, &self.nodes[b].token_ids);
                    assert_eq!(
                        round_down(common, self.block_size),
                        0,
                        "siblings share a whole-block prefix"
                    );
                }
                assert_eq!(self.nodes[a].parent, id);
            }
            stack.extend_from_slice(&node.children);
        }
        assert_eq!(total_blocks, self.num_blocks);
        assert_eq!(total_nodes, self.num_nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockAllocator;

    #[test]
    fn test_match_empty_cache() {
        let mut cache = PrefixCache::new(4);
        assert!(cache.match_prefix(&[1, 2, 3, 4]).is_empty());
        assert_eq!(cache.num_blocks(), 0);
    }

    #[test]
    fn test_insert_respects_block_alignment() {
        let allocator = BlockAllocator::new(4, 4);
        let mut cache = PrefixCache::new(4);

        // 6 tokens with 2 blocks: only the first whole block is cached
        let blocks = allocator.allocate(2).unwrap();
        let inserted = cache.insert(&[1, 2, 3, 4, 5, 6], &blocks);
        assert_eq!(inserted, 4);
        assert_eq!(cache.num_blocks(), 1);
        cache.assert_invariants();
    }

    #[test]
    fn test_insert_overlap_returns_only_new_tokens() {
        let allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let first = allocator.allocate(1).unwrap();
        assert_eq!(cache.insert(&[1, 2, 3, 4], &first), 4);

        // same prefix plus one more block: only the extension is new
        let mut both = first.clone();
        both.extend(allocator.allocate(1).unwrap());
        assert_eq!(cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &both), 4);
        assert_eq!(cache.num_blocks(), 2);
        cache.assert_invariants();
    }

    #[test]
    fn test_split_on_divergent_suffix() {
        let allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let x = allocator.allocate(2).unwrap();
        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &x);
        assert_eq!(cache.num_nodes(), 1);

        // shares the first block, diverges on the second
        let y = [x[0].clone(), allocator.allocate(1).unwrap().remove(0)];
        cache.insert(&[1, 2, 3, 4, 9, 10, 11, 12], &y);

        // split: [1,2,3,4] with children [5,6,7,8] and [9,10,11,12]
        assert_eq!(cache.num_nodes(), 3);
        assert_eq!(cache.num_blocks(), 3);
        cache.assert_invariants();

        assert_eq!(cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8]).len(), 2);
        assert_eq!(cache.match_prefix(&[1, 2, 3, 4, 9, 10, 11, 12]).len(), 2);
    }

    #[test]
    fn test_evict_lru_order() {
        let allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let a = allocator.allocate(1).unwrap();
        let b = allocator.allocate(1).unwrap();
        cache.insert(&[1, 2, 3, 4], &a);
        cache.insert(&[9, 9, 9, 9], &b);
        drop(a);
        drop(b);

        // touch the first entry so the second becomes the LRU victim
        let touched = cache.match_prefix(&[1, 2, 3, 4]);
        drop(touched);

        assert_eq!(cache.evict(1), 1);
        assert_eq!(cache.num_blocks(), 1);
        assert!(cache.match_prefix(&[9, 9, 9, 9]).is_empty());
        assert_eq!(cache.match_prefix(&[1, 2, 3, 4]).len(), 1);
        cache.assert_invariants();
    }

    #[test]
    fn test_evict_skips_shared_blocks() {
        let allocator = BlockAllocator::new(4, 4);
        let mut cache = PrefixCache::new(4);

        let blocks = allocator.allocate(1).unwrap();
        cache.insert(&[1, 2, 3, 4], &blocks);

        // the sequence still holds its handle: nothing to reclaim
        assert_eq!(cache.evict(1), 0);
        assert_eq!(cache.num_blocks(), 1);

        drop(blocks);
        assert_eq!(cache.evict(1), 1);
        assert_eq!(cache.num_blocks(), 0);
        cache.assert_invariants();
    }

    #[test]
    fn test_evict_partial_unshared_tail() {
        let allocator = BlockAllocator::new(4, 4);
        let mut cache = PrefixCache::new(4);

        let blocks = allocator.allocate(2).unwrap();
        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks);

        // keep the first block pinned, release the second
        let _pinned = blocks[0].clone();
        drop(blocks);

        assert_eq!(cache.evict(2), 1);
        assert_eq!(cache.num_blocks(), 1);
        // the pinned prefix still matches
        assert_eq!(cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8]).len(), 1);
        cache.assert_invariants();
    }

    #[test]
    fn test_evict_cascades_to_parent() {
        let allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let x = allocator.allocate(2).unwrap();
        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &x);
        let y = [x[0].clone(), allocator.allocate(1).unwrap().remove(0)];
        cache.insert(&[1, 2, 3, 4, 9, 10, 11, 12], &y);
        drop(x);
        drop(y);

        // three blocks across a parent and two leaves, all unshared
        assert_eq!(cache.evict(3), 3);
        assert_eq!(cache.num_blocks(), 0);
        assert_eq!(cache.num_nodes(), 0);
        cache.assert_invariants();
    }
}
