//! Requests: the admission surface and sibling-sequence ownership.
//!
//! A [`Request`] owns up to `n` sibling [`Sequence`]s (n-sampling). Siblings
//! are expanded lazily: the first sequence prefills the prompt, and the rest
//! are created once its KV state is resident so they can pick the prompt
//! blocks up from the prefix cache.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{SamplingParams, StoppingCriteria};
use crate::core::sequence::{FinishReason, Sequence, SequenceIdGen};
use crate::error::{Error, Result};

/// Scheduling priority class. Strict priority, FIFO within a class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Decode a wire priority value (`DEFAULT=0, HIGH=1, NORMAL=2, LOW=3`).
    /// `DEFAULT` maps to [`Priority::Normal`].
    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            0 | 2 => Ok(Self::Normal),
            1 => Ok(Self::High),
            3 => Ok(Self::Low),
            other => Err(Error::invalid_argument(format!(
                "unknown priority value {other}"
            ))),
        }
    }

    /// Encode to the wire value.
    pub fn to_wire(self) -> i32 {
        match self {
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Token usage accounting, reported with stream finals and completions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    fn for_sequence(seq: &Sequence) -> Self {
        let prompt_tokens = seq.num_prompt_tokens();
        let completion_tokens = seq.num_generated_tokens();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One streamed increment of a sequence's output.
///
/// Deltas carry token ids; turning them into text is the front end's job
/// (the incremental detokenizer lives next to the tokenizer, outside the
/// serving core).
#[derive(Debug, Clone)]
pub struct StreamDelta {
    /// Newly available tokens, in position order.
    pub token_ids: Vec<i32>,
    /// Present exactly once, on the final delta.
    pub finish_reason: Option<FinishReason>,
    /// Present together with `finish_reason`.
    pub usage: Option<Usage>,
}

/// Final output of one sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    /// Index of the sequence within its request.
    pub index: usize,
    /// Generated tokens (prompt excluded).
    pub token_ids: Vec<i32>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
}

/// Final output of a request: one entry per sequence plus aggregate usage.
#[derive(Debug, Clone)]
pub struct RequestOutput {
    pub id: String,
    pub outputs: Vec<SequenceOutput>,
    pub usage: Usage,
}

/// Streaming callback: `(sequence index, delta) -> keep_going`.
///
/// Invoked from the scheduler thread; must not block. Returning `false`
/// cancels the sequence at the next step boundary.
pub type OnStream = Box<dyn FnMut(usize, StreamDelta) -> bool + Send>;

/// Completion callback, invoked once when the request leaves the scheduler.
pub type OnFinish = Box<dyn FnOnce(Result<RequestOutput>) + Send>;

/// Liveness predicate polled from the scheduler thread; returning `false`
/// cancels the request. Must be cheap.
pub type LivenessCheck = Box<dyn Fn() -> bool + Send>;

/// A text-generation request and the sequences generated for it.
pub struct Request {
    /// Client-supplied request id.
    id: String,
    /// Admission timestamp.
    created_at: Instant,
    priority: Priority,
    /// Target fan-out: the request finishes once `num_seqs` sequences
    /// exist and all of them are finished.
    num_seqs: usize,
    prompt: String,
    prompt_tokens: Vec<i32>,
    /// Token capacity reserved per sequence.
    seq_capacity: usize,
    sampling: SamplingParams,
    stopping: StoppingCriteria,
    /// Replay the prompt in the first stream delta.
    echo: bool,
    on_stream: Option<OnStream>,
    on_finish: Option<OnFinish>,
    is_rpc_ok: Option<LivenessCheck>,
    /// Sibling sequences, expanded lazily up to `num_seqs`.
    pub(crate) sequences: Vec<Sequence>,
}

impl Request {
    /// Create a request with default priority and a fan-out of one.
    pub fn new(
        id: impl Into<String>,
        prompt: impl Into<String>,
        prompt_tokens: Vec<i32>,
        sampling: SamplingParams,
        stopping: StoppingCriteria,
    ) -> Self {
        // room for the prompt, the generation budget and one finishing token
        let mut seq_capacity = usize::MAX;
        if stopping.max_new_tokens > 0 {
            seq_capacity = seq_capacity.min(prompt_tokens.len() + stopping.max_new_tokens + 1);
        }
        if stopping.max_context_len > 0 {
            seq_capacity = seq_capacity.min(stopping.max_context_len + 1);
        }

        Self {
            id: id.into(),
            created_at: Instant::now(),
            priority: Priority::Normal,
            num_seqs: 1,
            prompt: prompt.into(),
            prompt_tokens,
            seq_capacity,
            sampling,
            stopping,
            echo: false,
            on_stream: None,
            on_finish: None,
            is_rpc_ok: None,
            sequences: Vec::new(),
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the sequence fan-out (`n`-sampling).
    pub fn with_num_seqs(mut self, num_seqs: usize) -> Self {
        self.num_seqs = num_seqs;
        self
    }

    /// Replay the prompt in the first stream delta.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Attach a streaming callback.
    pub fn with_stream(mut self, on_stream: OnStream) -> Self {
        self.on_stream = Some(on_stream);
        self
    }

    /// Attach a completion callback.
    pub fn with_on_finish(mut self, on_finish: OnFinish) -> Self {
        self.on_finish = Some(on_finish);
        self
    }

    /// Attach a liveness predicate (e.g. "is the RPC still connected").
    pub fn with_liveness(mut self, is_rpc_ok: LivenessCheck) -> Self {
        self.is_rpc_ok = Some(is_rpc_ok);
        self
    }

    // ========== Getters ==========

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    pub fn prompt_tokens(&self) -> &[i32] {
        &self.prompt_tokens
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn is_streaming(&self) -> bool {
        self.on_stream.is_some()
    }

    /// Reject malformed requests before they reach the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.prompt_tokens.is_empty() {
            return Err(Error::invalid_argument("empty prompt"));
        }
        if self.num_seqs == 0 {
            return Err(Error::invalid_argument("num_seqs must be at least 1"));
        }
        if self.stopping.max_new_tokens == 0 && self.stopping.max_context_len == 0 {
            return Err(Error::invalid_argument(
                "either max_new_tokens or max_context_len must bound generation",
            ));
        }
        let max_context_len = self.stopping.max_context_len;
        if max_context_len > 0 && self.prompt_tokens.len() > max_context_len {
            return Err(Error::invalid_argument(format!(
                "prompt length {} exceeds max context length {max_context_len}",
                self.prompt_tokens.len()
            )));
        }
        self.sampling.validate()
    }

    // ========== Lifecycle ==========

    /// Create the next sibling sequence.
    pub(crate) fn add_sequence(&mut self, ids: &SequenceIdGen) {
        self.sequences.push(Sequence::new(
            ids.next_id(),
            self.prompt.clone(),
            &self.prompt_tokens,
            self.seq_capacity,
            self.sampling.clone(),
            self.stopping.clone(),
            self.echo,
        ));
    }

    /// A request is finished once all `num_seqs` sequences exist and each
    /// has finished.
    pub fn is_finished(&self) -> bool {
        self.sequences.len() == self.num_seqs
            && self.sequences.iter().all(|seq| seq.is_finished())
    }

    /// A request is cancelled when the liveness predicate fails or any
    /// sibling was cancelled.
    pub fn is_cancelled(&self) -> bool {
        if let Some(is_rpc_ok) = &self.is_rpc_ok {
            if !is_rpc_ok() {
                return true;
            }
        }
        self.sequences.iter().any(|seq| seq.is_cancelled())
    }

    /// Siblings expand once the first sequence's prompt KV is resident,
    /// so they share the prompt blocks through the prefix cache.
    pub fn should_expand_sequences(&self) -> bool {
        if self.sequences.len() < self.num_seqs {
            let first = &self.sequences[0];
            return first.num_kv_cache_tokens() >= first.num_prompt_tokens();
        }
        false
    }

    /// Create all remaining siblings.
    pub(crate) fn expand_sequences(&mut self, ids: &SequenceIdGen) {
        while self.sequences.len() < self.num_seqs {
            self.add_sequence(ids);
        }
    }

    /// Stream pending output of one sequence to the client, if anything is
    /// pending. A declined delta cancels the sequence.
    pub(crate) fn stream_sequence(&mut self, seq_index: usize) {
        let Some(on_stream) = self.on_stream.as_mut() else {
            return;
        };
        let seq = &mut self.sequences[seq_index];
        let token_ids = seq.take_stream_delta();
        let finish_reason = if seq.is_finished() {
            seq.finish_reason()
        } else {
            None
        };
        if token_ids.is_empty() && finish_reason.is_none() {
            return;
        }
        let usage = finish_reason.map(|_| Usage::for_sequence(seq));
        let delta = StreamDelta {
            token_ids,
            finish_reason,
            usage,
        };
        if !on_stream(seq_index, delta) {
            self.sequences[seq_index].cancel();
        }
    }

    /// Surface a normal completion and consume the request.
    pub(crate) fn complete(mut self) {
        if let Some(on_finish) = self.on_finish.take() {
            let output = self.build_output();
            on_finish(Ok(output));
        }
    }

    /// Surface a terminal error and consume the request.
    pub(crate) fn fail(mut self, error: Error) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(Err(error));
        }
    }

    fn build_output(&self) -> RequestOutput {
        let outputs: Vec<SequenceOutput> = self
            .sequences
            .iter()
            .enumerate()
            .map(|(index, seq)| SequenceOutput {
                index,
                token_ids: seq.token_ids()[seq.num_prompt_tokens()..].to_vec(),
                finish_reason: seq.finish_reason(),
                usage: Usage::for_sequence(seq),
            })
            .collect();
        let usage = outputs.iter().fold(Usage::default(), |acc, out| Usage {
            prompt_tokens: acc.prompt_tokens + out.usage.prompt_tokens,
            completion_tokens: acc.completion_tokens + out.usage.completion_tokens,
            total_tokens: acc.total_tokens + out.usage.total_tokens,
        });
        RequestOutput {
            id: self.id.clone(),
            outputs,
            usage,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("num_seqs", &self.num_seqs)
            .field("prompt_len", &self.prompt_tokens.len())
            .field("sequences", &self.sequences.len())
            .finish()
    }
}
