//! The model-executor boundary.
//!
//! The executor is everything on the other side of the serving core: the
//! attention and MLP kernels, the weights, the sampler. The core only ever
//! sees it through this narrow capability interface: hand over a packed
//! [`ModelInput`], get back one sampled token per sequence slot.

use crate::scheduler::batch::ModelInput;

/// Output of one executor invocation.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    /// One sampled token id per input sequence, in batch order.
    pub next_tokens: Vec<i32>,
}

/// Capability interface over the model executor.
///
/// Executor failures are not recoverable at this boundary: an
/// implementation either returns sampled tokens or panics the process,
/// since the GPU state cannot be resumed after a partial update.
pub trait Executor {
    /// Run the model over a packed batch and sample one token per sequence.
    fn execute(&mut self, input: ModelInput) -> BatchOutput;

    /// Report `(free_bytes, total_bytes)` of device memory, used to size
    /// the block pool at startup.
    fn profile_memory(&self) -> (u64, u64);
}
