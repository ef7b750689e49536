//! Batch assembly: packing scheduled sequences into a [`ModelInput`].
//!
//! A [`Batch`] records which sequences run this step and how many tokens
//! each may process. Packing flattens their pending tokens into the dense
//! arrays the executor consumes.

use std::collections::HashMap;

use crate::config::SamplingParams;
use crate::core::request::Request;

/// Key of a request inside the scheduler's table.
pub(crate) type RequestKey = u64;

/// Packed executor input covering one or more sequences.
///
/// All per-token vectors share the same length `Σ n_tokens_to_process`;
/// per-sequence vectors have one entry per batch slot (`q_cu_lens` and
/// `kv_cu_lens` carry a leading zero).
#[derive(Debug, Clone, Default)]
pub struct ModelInput {
    /// Tokens to process, all sequences concatenated.
    pub token_ids: Vec<i32>,
    /// Sequence-local position of each entry of `token_ids`.
    pub positions: Vec<i32>,
    /// Cumulative query lengths, `[0, q_0, q_0+q_1, ...]`.
    pub q_cu_lens: Vec<i32>,
    /// Cumulative KV lengths after this step's writes.
    pub kv_cu_lens: Vec<i32>,
    /// Flat KV slot id receiving each processed token's state.
    pub new_cache_slots: Vec<i32>,
    /// Per-sequence physical block ids, zero-padded to the widest row.
    pub block_tables: Vec<Vec<i32>>,
    /// Per-sequence sampling parameters.
    pub sampling: Vec<SamplingParams>,
    /// Index into `token_ids` whose logits feed each sequence's sampler.
    pub last_token_indexes: Vec<i32>,
    /// Longest per-sequence query this step.
    pub q_max_len: usize,
    /// Longest per-sequence KV length this step.
    pub kv_max_len: usize,
    /// Number of sequences in the batch.
    pub num_sequences: usize,
    /// True when every sequence is still prefilling.
    pub all_prefill: bool,
}

/// One scheduled sequence: where it lives and how many tokens it may
/// process this step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchEntry {
    pub(crate) request_key: RequestKey,
    pub(crate) seq_index: usize,
    /// Token quota granted by the fill phase (and raised by top-up).
    pub(crate) token_budget: usize,
    /// Tokens actually packed for this sequence, set by `prepare`.
    pub(crate) actual_tokens: usize,
}

/// The set of sequences scheduled for one step.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, request_key: RequestKey, seq_index: usize, token_budget: usize) {
        self.entries.push(BatchEntry {
            request_key,
            seq_index,
            token_budget,
            actual_tokens: 0,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [BatchEntry] {
        &mut self.entries
    }

    /// Pack every entry's pending tokens into a [`ModelInput`].
    ///
    /// For each sequence the window `[kv_cached, kv_cached + n)` is packed,
    /// where `n = min(token_budget, T - kv_cached)`; `n` is recorded in the
    /// entry so the scheduler can advance the cursor once the executor
    /// returns.
    pub(crate) fn prepare(&mut self, requests: &HashMap<RequestKey, Request>) -> ModelInput {
        let mut input = ModelInput {
            num_sequences: self.entries.len(),
            all_prefill: true,
            ..Default::default()
        };
        input.q_cu_lens.push(0);
        input.kv_cu_lens.push(0);

        let mut max_blocks = 0;
        for entry in &mut self.entries {
            let seq = &requests[&entry.request_key].sequences()[entry.seq_index];
            assert!(!seq.is_finished(), "finished sequence in batch");

            let kv_cached = seq.num_kv_cache_tokens();
            let num_tokens = seq.num_tokens();
            let n_to_process = (num_tokens - kv_cached).min(entry.token_budget);
            assert!(n_to_process > 0, "scheduled sequence has no tokens to process");
            assert!(seq.kv_cache_capacity() >= kv_cached + n_to_process);
            entry.actual_tokens = n_to_process;

            input.all_prefill &= seq.is_prefill();

            let window_end = kv_cached + n_to_process;
            input
                .token_ids
                .extend_from_slice(&seq.token_ids()[kv_cached..window_end]);
            input
                .positions
                .extend((kv_cached..window_end).map(|pos| pos as i32));
            input
                .last_token_indexes
                .push(input.token_ids.len() as i32 - 1);

            input
                .q_cu_lens
                .push(input.q_cu_lens[input.q_cu_lens.len() - 1] + n_to_process as i32);
            input
                .kv_cu_lens
                .push(input.kv_cu_lens[input.kv_cu_lens.len() - 1] + window_end as i32);
            input.q_max_len = input.q_max_len.max(n_to_process);
            input.kv_max_len = input.kv_max_len.max(window_end);

            input
                .new_cache_slots
                .extend(seq.kv_cache_slots(kv_cached, window_end));

            let block_ids: Vec<i32> = seq.blocks().iter().map(|b| b.id() as i32).collect();
            max_blocks = max_blocks.max(block_ids.len());
            input.block_tables.push(block_ids);

            input.sampling.push(seq.sampling_params().clone());
        }

        for row in &mut input.block_tables {
            row.resize(max_blocks, 0);
        }
        input
    }
}
