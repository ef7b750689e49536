//! Continuous-batching scheduler.
//!
//! One scheduler thread owns every mutable piece of the serving core:
//! requests, sequences, the block manager and the prefix cache. RPC threads
//! only ever touch the bounded intake channel through a
//! [`SchedulerHandle`].
//!
//! Each [`step`](ContinuousScheduler::step) builds the next batch under the
//! per-iteration token and sequence budgets, mixing prompt processing and
//! decode across requests, runs the executor once, feeds sampled tokens
//! back into their sequences, streams deltas and surfaces completions.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error};

use crate::config::{EngineConfig, SchedulerConfig};
use crate::core::block_manager::BlockManager;
use crate::core::request::{Priority, Request};
use crate::core::sequence::{FinishReason, SequenceIdGen};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::scheduler::batch::{Batch, RequestKey};

/// Cloneable admission handle shared with request-ingestion threads.
#[derive(Clone)]
pub struct SchedulerHandle {
    intake: Sender<Request>,
}

impl SchedulerHandle {
    /// Validate and enqueue a request for scheduling.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for malformed requests (never reach the
    ///   scheduler).
    /// - [`Error::AdmissionFull`] when the intake channel is at capacity.
    /// - [`Error::Shutdown`] when the scheduler is gone.
    pub fn submit(&self, request: Request) -> Result<()> {
        request.validate()?;
        self.intake.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => Error::AdmissionFull,
            TrySendError::Disconnected(_) => Error::Shutdown,
        })
    }
}

/// What one `step` accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStats {
    /// Sequences in the executed batch.
    pub scheduled_sequences: usize,
    /// Tokens processed across the batch.
    pub processed_tokens: usize,
    /// Requests that left the scheduler (completed, cancelled or failed).
    pub finished_requests: usize,
}

/// Heap entry ordering the ready queue by priority, FIFO within a class.
///
/// Request keys are assigned in admission order, so ascending key is
/// ascending arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    key: RequestKey,
    priority: Priority,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Iteration-level scheduler mixing prefill and decode work across
/// requests.
pub struct ContinuousScheduler<E: Executor> {
    config: SchedulerConfig,
    executor: E,
    block_manager: BlockManager,
    /// Bounded channel fed by RPC threads.
    intake: Receiver<Request>,
    /// All live requests, keyed by admission order.
    requests: HashMap<RequestKey, Request>,
    /// Requests awaiting (or re-awaiting) scheduling.
    ready: BinaryHeap<ReadyEntry>,
    /// The batch executed last; carried over at the start of each step.
    batch: Batch,
    /// Requests in `batch`, in schedule order.
    batch_keys: Vec<RequestKey>,
    /// In-flight requests holding blocks, front = highest priority. The
    /// back is the preferred preemption victim.
    preemptable: VecDeque<RequestKey>,
    seq_ids: SequenceIdGen,
    next_key: RequestKey,
}

impl<E: Executor> ContinuousScheduler<E> {
    /// Create a scheduler and its admission handle.
    pub fn new(
        engine_config: &EngineConfig,
        config: SchedulerConfig,
        executor: E,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = bounded(config.intake_capacity);
        let scheduler = Self {
            config,
            executor,
            block_manager: BlockManager::with_prefix_cache(
                engine_config.num_blocks,
                engine_config.block_size,
                engine_config.enable_prefix_cache,
            ),
            intake: rx,
            requests: HashMap::new(),
            ready: BinaryHeap::new(),
            batch: Batch::new(),
            batch_keys: Vec::new(),
            preemptable: VecDeque::new(),
            seq_ids: SequenceIdGen::new(),
            next_key: 0,
        };
        (scheduler, SchedulerHandle { intake: tx })
    }

    /// The block manager owned by this scheduler.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Whether any request is admitted or queued for admission.
    pub fn has_pending_work(&self) -> bool {
        !self.requests.is_empty() || !self.intake.is_empty()
    }

    /// Run one scheduling iteration.
    ///
    /// Builds a batch, executes it, and feeds results back into the
    /// sequences. When nothing is schedulable the call blocks on the intake
    /// channel for up to `timeout` waiting for new arrivals.
    pub fn step(&mut self, timeout: Duration) -> StepStats {
        let deadline = Instant::now() + timeout;
        let mut finished_requests = 0;
        loop {
            self.drain_intake();
            finished_requests += self.build_batch();
            if !self.batch.is_empty() {
                break;
            }
            // an OOM-terminated head may have unblocked the next request
            if !self.ready.is_empty() {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return StepStats {
                    finished_requests,
                    ..Default::default()
                };
            }
            match self.intake.recv_timeout(deadline - now) {
                Ok(request) => self.admit(request),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return StepStats {
                        finished_requests,
                        ..Default::default()
                    };
                }
            }
        }

        // defensive: a batch with nothing to process never reaches the
        // executor; carry-over requeues its requests next step
        let has_work = self.batch.entries().iter().any(|entry| {
            self.requests.get(&entry.request_key).is_some_and(|request| {
                let seq = &request.sequences()[entry.seq_index];
                seq.num_tokens_to_process().min(entry.token_budget) > 0
            })
        });
        if !has_work {
            return StepStats {
                finished_requests,
                ..Default::default()
            };
        }

        let input = self.batch.prepare(&self.requests);
        let processed_tokens = input.token_ids.len();
        let scheduled_sequences = input.num_sequences;
        let output = self.executor.execute(input);
        self.apply_output(&output.next_tokens);

        StepStats {
            scheduled_sequences,
            processed_tokens,
            finished_requests,
        }
    }

    // ========== Admission ==========

    fn drain_intake(&mut self) {
        while let Ok(request) = self.intake.try_recv() {
            self.admit(request);
        }
    }

    fn admit(&mut self, mut request: Request) {
        request.add_sequence(&self.seq_ids);
        // a fully cached prompt lets every sibling share it from the start
        if request.num_seqs() > 1 && self.block_manager.prompt_fully_cached(&request.sequences[0])
        {
            request.expand_sequences(&self.seq_ids);
        }

        let key = self.next_key;
        self.next_key += 1;
        self.ready.push(ReadyEntry {
            key,
            priority: request.priority(),
        });
        self.requests.insert(key, request);
    }

    // ========== Batch building ==========

    /// Carry over the previous batch, then fill a new one under the step
    /// budgets. Returns the number of requests surfaced to clients.
    fn build_batch(&mut self) -> usize {
        let mut finished = 0;

        // carry-over: reverse order puts the highest-priority in-flight
        // request at the front of the preemptable deque
        let prev_keys = std::mem::take(&mut self.batch_keys);
        self.batch = Batch::new();
        for key in prev_keys.into_iter().rev() {
            let (is_finished, is_cancelled, priority) = match self.requests.get(&key) {
                Some(request) => (
                    request.is_finished(),
                    request.is_cancelled(),
                    request.priority(),
                ),
                None => continue,
            };
            // cancellation wins over a normal finish: a stream callback
            // declining a delta also marks its sequence finished
            if is_cancelled {
                self.cancel_request(key);
                finished += 1;
            } else if is_finished {
                self.finish_request(key);
                finished += 1;
            } else {
                self.preemptable.push_front(key);
                self.ready.push(ReadyEntry { key, priority });
            }
        }

        let max_tokens = self.config.max_tokens_per_batch;
        let max_seqs = self.config.max_seqs_per_batch;
        let avg_token_budget = (max_tokens / max_seqs).max(1);
        // degenerate configs still grant one token per schedulable sequence
        let mut remaining_tokens = max_tokens.max(max_seqs);
        let mut remaining_seqs = max_seqs.max(1);

        let mut batch = Batch::new();
        let mut batch_keys: Vec<RequestKey> = Vec::new();

        // fill: admit requests in priority order while budgets remain,
        // preempting the lowest-priority block holders on allocation failure
        while remaining_tokens > 0 && remaining_seqs > 0 {
            let Some(top) = self.ready.peek() else {
                break;
            };
            let key = top.key;
            let Some(request) = self.requests.get_mut(&key) else {
                self.ready.pop();
                continue;
            };

            let mut candidates: Vec<(usize, usize)> = Vec::new();
            let mut allocated_tokens = 0;
            let mut allocated_seqs = 0;
            let mut has_enough_blocks = true;
            for seq_index in 0..request.sequences.len() {
                let seq = &mut request.sequences[seq_index];
                if seq.is_finished() {
                    continue;
                }
                if allocated_tokens >= remaining_tokens || allocated_seqs >= remaining_seqs {
                    break;
                }
                let token_budget = avg_token_budget.min(remaining_tokens - allocated_tokens);
                let target = seq.num_kv_cache_tokens() + token_budget;
                if self.block_manager.allocate_for(seq, target).is_err() {
                    has_enough_blocks = false;
                    break;
                }
                let actual = seq.num_tokens_to_process().min(token_budget);
                allocated_tokens += actual;
                allocated_seqs += 1;
                candidates.push((seq_index, actual));
            }

            if has_enough_blocks {
                self.ready.pop();
                for (seq_index, actual) in candidates {
                    batch.add(key, seq_index, actual);
                }
                batch_keys.push(key);
                remaining_tokens -= allocated_tokens;
                remaining_seqs -= allocated_seqs;
                // scheduled requests are off limits for preemption
                self.preemptable.retain(|&k| k != key);
                continue;
            }

            // preempt the lowest-priority in-flight request and retry;
            // the candidate itself is skipped, never released
            if let Some(victim_key) = self.preemptable.pop_back() {
                if victim_key != key {
                    debug!(victim = victim_key, contender = key, "preempting request");
                    if let Some(victim) = self.requests.get_mut(&victim_key) {
                        for seq in &mut victim.sequences {
                            self.block_manager.release(seq);
                        }
                    }
                }
                continue;
            }

            // nothing left to preempt; the request stays in `ready`
            break;
        }

        // top-up: spend leftover token budget on more prefill work
        if remaining_tokens > 0 {
            for entry in batch.entries_mut() {
                remaining_tokens += entry.token_budget;
                let Some(request) = self.requests.get_mut(&entry.request_key) else {
                    continue;
                };
                let seq = &mut request.sequences[entry.seq_index];
                let target = seq.num_kv_cache_tokens() + remaining_tokens;
                if self.block_manager.allocate_for(seq, target).is_err() {
                    break;
                }
                let actual = seq.num_tokens_to_process().min(remaining_tokens);
                entry.token_budget = actual;
                remaining_tokens -= actual;
                if remaining_tokens == 0 {
                    break;
                }
            }
        }

        // the head request cannot be served with current memory at all
        if batch.is_empty() {
            if let Some(entry) = self.ready.pop() {
                error!(request = entry.key, "not enough memory to schedule a single sequence");
                if let Some(mut request) = self.requests.remove(&entry.key) {
                    for seq in &mut request.sequences {
                        seq.release_blocks();
                    }
                    request.fail(Error::OutOfMemory);
                    finished += 1;
                }
                self.preemptable.retain(|&k| k != entry.key);
            }
        }

        self.batch = batch;
        self.batch_keys = batch_keys;
        finished
    }

    // ========== Result processing ==========

    /// Commit KV cursors, append sampled tokens, stream deltas and expand
    /// siblings after an executor run.
    fn apply_output(&mut self, next_tokens: &[i32]) {
        assert_eq!(next_tokens.len(), self.batch.len(), "executor output shape");

        for (entry, &token_id) in self.batch.entries().iter().zip(next_tokens) {
            let Some(request) = self.requests.get_mut(&entry.request_key) else {
                continue;
            };
            let seq = &mut request.sequences[entry.seq_index];
            seq.commit_kv_cache(entry.actual_tokens);
            // mid-prompt chunks produce no usable logits; the sampled token
            // only counts once the whole prompt is resident
            if !seq.is_prefill() && !seq.is_finished() {
                seq.append_token(token_id);
            }
            request.stream_sequence(entry.seq_index);
        }

        for i in 0..self.batch_keys.len() {
            let key = self.batch_keys[i];
            let Some(request) = self.requests.get_mut(&key) else {
                continue;
            };
            if request.should_expand_sequences() {
                // publish the prompt blocks so siblings pick them up from
                // the prefix cache on their first allocation
                self.block_manager.cache_prompt(&request.sequences[0]);
                request.expand_sequences(&self.seq_ids);
            }
        }
    }

    // ========== Request retirement ==========

    /// Release a finished request's blocks (donating prefixes to the cache)
    /// and surface its output.
    fn finish_request(&mut self, key: RequestKey) {
        if let Some(mut request) = self.requests.remove(&key) {
            for seq in &mut request.sequences {
                self.block_manager.release(seq);
            }
            request.complete();
        }
        self.preemptable.retain(|&k| k != key);
    }

    /// Cancel every live sequence of a request, emit terminal stream
    /// deltas, and release its blocks keeping only the prompt cached.
    fn cancel_request(&mut self, key: RequestKey) {
        if let Some(mut request) = self.requests.remove(&key) {
            debug!(request = request.id(), "cancelling request");
            for seq in &request.sequences {
                if !seq.is_finished() {
                    seq.cancel();
                }
            }
            // terminal deltas only for the newly cancelled sequences;
            // siblings that finished normally already streamed theirs
            for seq_index in 0..request.sequences.len() {
                if request.sequences[seq_index].finish_reason() == Some(FinishReason::Cancelled) {
                    request.stream_sequence(seq_index);
                }
            }
            for seq in &mut request.sequences {
                self.block_manager.release_prompt_only(seq);
            }
            request.complete();
        }
        self.preemptable.retain(|&k| k != key);
    }
}
