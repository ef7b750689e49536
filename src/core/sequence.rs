//! Sequence state for inference requests.
//!
//! A [`Sequence`] tracks one generation: the prompt, generated tokens, the
//! KV cursor(s), the blocks backing its cache slots, and the finish state.
//! All mutation happens on the scheduler thread between steps.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{SamplingParams, StoppingCriteria};
use crate::core::block::Block;

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Monotonic source of sequence ids.
///
/// Constructor-injected (owned by the scheduler) rather than process-global;
/// cheap to clone and share with request expansion sites.
#[derive(Debug, Clone)]
pub struct SequenceIdGen {
    next: Arc<AtomicU64>,
}

impl SequenceIdGen {
    /// Create a generator starting at id 1.
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Take the next id.
    pub fn next_id(&self) -> SequenceId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Which KV cursor a step advances.
///
/// The data model carries one cursor per engine so a draft model and a main
/// model can run on slightly divergent prefixes; single-engine serving only
/// ever touches [`KvEngine::Main`]. The two cursors never drift apart by
/// more than one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEngine {
    /// The serving model.
    Main = 0,
    /// The draft model used for speculative decoding.
    Draft = 1,
}

/// Reason a sequence stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// EOS, a stop token, or a stop sequence was hit.
    Stop,
    /// The generated-token or context-length limit was reached.
    Length,
    /// The model emitted a function/tool call.
    FunctionCall,
    /// The client disconnected or the stream callback declined the delta.
    Cancelled,
}

impl FinishReason {
    /// Wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::FunctionCall => "function_call",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-generation state: prompt, generated tokens, KV cursors and blocks.
pub struct Sequence {
    /// Unique sequence id.
    id: SequenceId,
    /// Original prompt text (may be empty when the caller pre-tokenized).
    prompt: String,
    /// Prompt tokens followed by generated tokens. Capacity is reserved up
    /// front and never grows, so slices stay valid across appends.
    token_ids: Vec<i32>,
    /// Length of the immutable prompt prefix.
    num_prompt_tokens: usize,
    /// Hard capacity of `token_ids`.
    capacity: usize,
    /// Occurrence count per token id, for repetition-class penalties.
    token_counts: HashMap<i32, u32>,
    /// One KV cursor per engine; `kv_cursors[e]` counts tokens whose KV
    /// state is resident in `blocks`.
    kv_cursors: [usize; 2],
    /// Currently active engine.
    engine: KvEngine,
    /// Blocks covering `[0, blocks.len() * block_size)` slots.
    blocks: Vec<Block>,
    /// Sampling parameters forwarded to the executor.
    sampling: SamplingParams,
    /// Stopping criteria evaluated after every append.
    stopping: StoppingCriteria,
    /// Tokens before this offset have been streamed to the client.
    output_offset: usize,
    /// Set when the stream callback declines a delta or the client is gone.
    cancelled: Cell<bool>,
    /// Cached finish decision, invalidated by `append_token`.
    finished: Cell<bool>,
    finish_reason: Cell<Option<FinishReason>>,
    finish_valid: Cell<bool>,
}

impl Sequence {
    /// Create a sequence over `prompt_tokens` with room for `capacity`
    /// tokens in total.
    ///
    /// With `echo` set, streaming replays the prompt tokens in the first
    /// delta; otherwise only generated tokens are streamed.
    pub fn new(
        id: SequenceId,
        prompt: String,
        prompt_tokens: &[i32],
        capacity: usize,
        sampling: SamplingParams,
        stopping: StoppingCriteria,
        echo: bool,
    ) -> Self {
        assert!(!prompt_tokens.is_empty(), "empty prompt token ids");
        assert!(capacity >= prompt_tokens.len());

        let mut token_ids = Vec::with_capacity(capacity);
        token_ids.extend_from_slice(prompt_tokens);
        let mut token_counts = HashMap::new();
        for &token_id in prompt_tokens {
            *token_counts.entry(token_id).or_insert(0) += 1;
        }
        let num_prompt_tokens = prompt_tokens.len();

        Self {
            id,
            prompt,
            token_ids,
            num_prompt_tokens,
            capacity,
            token_counts,
            kv_cursors: [0; 2],
            engine: KvEngine::Main,
            blocks: Vec::new(),
            sampling,
            stopping,
            output_offset: if echo { 0 } else { num_prompt_tokens },
            cancelled: Cell::new(false),
            finished: Cell::new(false),
            finish_reason: Cell::new(None),
            finish_valid: Cell::new(false),
        }
    }

    // ========== Token accounting ==========

    /// Sequence id.
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Prompt text.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// All valid tokens (prompt + generated).
    pub fn token_ids(&self) -> &[i32] {
        &self.token_ids
    }

    /// Total number of tokens.
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    /// Length of the prompt prefix.
    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    /// Number of generated tokens (0 while still in prefill).
    pub fn num_generated_tokens(&self) -> usize {
        self.token_ids.len().saturating_sub(self.num_prompt_tokens)
    }

    /// Occurrence count per token id.
    pub fn token_counts(&self) -> &HashMap<i32, u32> {
        &self.token_counts
    }

    /// Sampling parameters.
    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Stopping criteria.
    pub fn stopping_criteria(&self) -> &StoppingCriteria {
        &self.stopping
    }

    /// Append a generated token and re-evaluate the finish decision.
    ///
    /// # Panics
    ///
    /// Panics if the sequence is finished, still in prefill, or out of
    /// capacity — all scheduler bugs.
    pub fn append_token(&mut self, token_id: i32) {
        assert!(!self.is_finished(), "append to a finished sequence");
        assert!(!self.is_prefill(), "append to a prefill sequence");
        assert!(self.token_ids.len() < self.capacity, "sequence out of capacity");

        self.token_ids.push(token_id);
        *self.token_counts.entry(token_id).or_insert(0) += 1;
        self.finish_valid.set(false);
    }

    // ========== KV cursors ==========

    /// Select the cursor subsequent commits advance.
    pub fn set_engine(&mut self, engine: KvEngine) {
        self.engine = engine;
    }

    /// Tokens resident in the KV cache for the active engine.
    pub fn num_kv_cache_tokens(&self) -> usize {
        self.kv_cursors[self.engine as usize]
    }

    /// Tokens resident in the KV cache for a specific engine.
    pub fn num_kv_cache_tokens_for(&self, engine: KvEngine) -> usize {
        self.kv_cursors[engine as usize]
    }

    /// The token prefix whose KV state is resident.
    ///
    /// With two engines the cursors may be out of sync by at most one
    /// token; within that tolerance the shorter prefix is the one both
    /// engines agree on.
    pub fn tokens_in_kv_cache(&self) -> &[i32] {
        let main = self.kv_cursors[KvEngine::Main as usize];
        let draft = self.kv_cursors[KvEngine::Draft as usize];
        let len = if main.abs_diff(draft) <= 1 {
            main.min(draft)
        } else {
            self.kv_cursors[self.engine as usize]
        };
        &self.token_ids[..len]
    }

    /// Number of tokens waiting to be processed (`T - kv_cached`).
    pub fn num_tokens_to_process(&self) -> usize {
        self.token_ids.len() - self.num_kv_cache_tokens()
    }

    /// A sequence is in prefill until the prompt's KV state is resident.
    pub fn is_prefill(&self) -> bool {
        self.num_kv_cache_tokens() < self.num_prompt_tokens
    }

    /// Advance the active cursor after the executor processed `count` tokens.
    pub fn commit_kv_cache(&mut self, count: usize) {
        let capacity = self.kv_cache_capacity();
        let cursor = &mut self.kv_cursors[self.engine as usize];
        assert!(*cursor + count <= capacity);
        *cursor += count;
    }

    /// Roll the active cursor back by `count` tokens.
    pub fn rewind_kv_cache(&mut self, count: usize) {
        let cursor = &mut self.kv_cursors[self.engine as usize];
        assert!(*cursor >= count);
        *cursor -= count;
    }

    // ========== Blocks ==========

    /// Blocks currently owned by this sequence.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of owned blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Token slots covered by the owned blocks.
    pub fn kv_cache_capacity(&self) -> usize {
        match self.blocks.first() {
            Some(block) => self.blocks.len() * block.size(),
            None => 0,
        }
    }

    /// Take ownership of freshly allocated blocks.
    pub fn append_blocks(&mut self, new_blocks: Vec<Block>) {
        self.blocks.extend(new_blocks);
    }

    /// Adopt shared blocks matched from the prefix cache and fast-forward
    /// the KV cursors over them.
    ///
    /// Must run before any other block is attached. When the shared blocks
    /// cover the entire prompt the cursor stops one token short: the
    /// executor needs at least one query token to produce logits, and
    /// re-running the identical token rewrites identical KV state.
    pub fn append_shared_blocks(&mut self, shared: Vec<Block>) {
        assert!(self.blocks.is_empty(), "shared blocks must come first");
        if shared.is_empty() {
            return;
        }
        let block_size = shared[0].size();
        let mut kv_pos = shared.len() * block_size;
        self.blocks.extend(shared);

        if kv_pos == self.num_prompt_tokens {
            kv_pos -= 1;
        }
        assert!(kv_pos < self.num_prompt_tokens);
        self.kv_cursors = [kv_pos; 2];
    }

    /// Drop all block handles and reset the KV cursors.
    ///
    /// Unshared blocks return to the allocator free list as their last
    /// handles drop.
    pub fn release_blocks(&mut self) {
        self.kv_cursors = [0; 2];
        self.blocks.clear();
    }

    /// Flat KV slot ids for positions `[pos_start, pos_end)`.
    pub fn kv_cache_slots(&self, pos_start: usize, pos_end: usize) -> Vec<i32> {
        debug_assert!(!self.blocks.is_empty(), "no cache blocks allocated");
        let block_size = self.blocks[0].size();
        (pos_start..pos_end)
            .map(|pos| self.blocks[pos / block_size].slot(pos % block_size))
            .collect()
    }

    // ========== Finish state ==========

    /// Mark the sequence cancelled; it finishes with
    /// [`FinishReason::Cancelled`] at the next finish evaluation.
    pub fn cancel(&self) {
        self.cancelled.set(true);
        self.finish_valid.set(false);
    }

    /// Whether the sequence was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Whether generation has stopped. The decision is cached until the
    /// next append or cancellation.
    pub fn is_finished(&self) -> bool {
        if self.finish_valid.get() {
            return self.finished.get();
        }
        self.check_finished()
    }

    /// Why the sequence finished, if it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        if !self.finish_valid.get() {
            self.check_finished();
        }
        self.finish_reason.get()
    }

    fn check_finished(&self) -> bool {
        self.finish_valid.set(true);

        let last_token_id = self.token_ids[self.token_ids.len() - 1];
        if !self.stopping.ignore_eos && last_token_id == self.stopping.eos_token_id {
            return self.finish_with(FinishReason::Stop);
        }
        if self.stopping.stop_token_ids.contains(&last_token_id) {
            return self.finish_with(FinishReason::Stop);
        }
        for stop_sequence in &self.stopping.stop_sequences {
            if stop_sequence.last() == Some(&last_token_id)
                && self.token_ids.ends_with(stop_sequence)
            {
                return self.finish_with(FinishReason::Stop);
            }
        }
        let max_new_tokens = self.stopping.max_new_tokens;
        if max_new_tokens > 0 && self.num_generated_tokens() >= max_new_tokens {
            return self.finish_with(FinishReason::Length);
        }
        let max_context_len = self.stopping.max_context_len;
        if max_context_len > 0 && self.num_tokens() >= max_context_len {
            return self.finish_with(FinishReason::Length);
        }
        if self.cancelled.get() {
            return self.finish_with(FinishReason::Cancelled);
        }
        self.finished.set(false);
        self.finish_reason.set(None);
        false
    }

    fn finish_with(&self, reason: FinishReason) -> bool {
        self.finished.set(true);
        self.finish_reason.set(Some(reason));
        true
    }

    // ========== Streaming ==========

    /// Force both KV cursors, bypassing capacity checks. Test-only.
    #[cfg(test)]
    pub(crate) fn force_kv_cursors(&mut self, count: usize) {
        self.kv_cursors = [count; 2];
    }

    /// Tokens not yet streamed to the client; advances the stream offset.
    ///
    /// The prompt portion is included only when the sequence was created
    /// with `echo`.
    pub fn take_stream_delta(&mut self) -> Vec<i32> {
        let delta = self.token_ids[self.output_offset..].to_vec();
        self.output_offset = self.token_ids.len();
        delta
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("num_tokens", &self.num_tokens())
            .field("num_prompt_tokens", &self.num_prompt_tokens)
            .field("kv_cached", &self.num_kv_cache_tokens())
            .field("num_blocks", &self.blocks.len())
            .field("finished", &self.finished.get())
            .finish()
    }
}
