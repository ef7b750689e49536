//! Configuration types for infercore.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration: sizing of the paged KV cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tokens per KV cache block (power of two, typically 8/16/32).
    pub block_size: usize,
    /// Total number of physical blocks in the pool.
    pub num_blocks: usize,
    /// Enable the shared prefix cache.
    pub enable_prefix_cache: bool,
    /// Fraction of free device memory usable for the KV cache.
    pub max_memory_utilization: f64,
    /// Optional hard cap on the cache footprint in bytes.
    pub max_cache_size_bytes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 1024,
            enable_prefix_cache: true,
            max_memory_utilization: 0.9,
            max_cache_size_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Derive the block count from an executor memory profile.
    ///
    /// Applies `max_memory_utilization` to the free bytes reported by
    /// [`Executor::profile_memory`](crate::executor::Executor::profile_memory)
    /// and honors `max_cache_size_bytes` when set.
    pub fn num_blocks_from_profile(&self, free_bytes: u64, bytes_per_block: u64) -> usize {
        let mut budget = (free_bytes as f64 * self.max_memory_utilization) as u64;
        if let Some(cap) = self.max_cache_size_bytes {
            budget = budget.min(cap);
        }
        (budget / bytes_per_block.max(1)) as usize
    }

    /// Check the configuration for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.num_blocks == 0 {
            return Err(Error::invalid_argument("num_blocks must be non-zero"));
        }
        if self.max_memory_utilization <= 0.0 || self.max_memory_utilization > 1.0 {
            return Err(Error::invalid_argument(format!(
                "max_memory_utilization must be in (0, 1], got {}",
                self.max_memory_utilization
            )));
        }
        Ok(())
    }
}

/// Scheduler configuration: per-iteration batch budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tokens processed per batch.
    pub max_tokens_per_batch: usize,
    /// Maximum number of sequences per batch.
    pub max_seqs_per_batch: usize,
    /// Capacity of the intake channel; admissions beyond it fail fast.
    pub intake_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_batch: 1024,
            max_seqs_per_batch: 128,
            intake_capacity: 4096,
        }
    }
}

impl SchedulerConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens_per_batch == 0 {
            return Err(Error::invalid_argument("max_tokens_per_batch must be non-zero"));
        }
        if self.max_seqs_per_batch == 0 {
            return Err(Error::invalid_argument("max_seqs_per_batch must be non-zero"));
        }
        if self.intake_capacity == 0 {
            return Err(Error::invalid_argument("intake_capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Per-request sampling parameters, forwarded verbatim to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature (0.0 = greedy).
    pub temperature: f32,
    /// Top-p (nucleus) sampling; 1.0 disables.
    pub top_p: f32,
    /// Top-k sampling; 0 disables.
    pub top_k: usize,
    /// Frequency penalty in [-2, 2].
    pub frequency_penalty: f32,
    /// Presence penalty in [-2, 2].
    pub presence_penalty: f32,
    /// Repetition penalty; 1.0 disables.
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
        }
    }
}

impl SamplingParams {
    /// Check the parameters for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 {
            return Err(Error::invalid_argument(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(Error::invalid_argument(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(Error::invalid_argument(format!(
                "frequency_penalty must be in [-2, 2], got {}",
                self.frequency_penalty
            )));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(Error::invalid_argument(format!(
                "presence_penalty must be in [-2, 2], got {}",
                self.presence_penalty
            )));
        }
        if self.repetition_penalty <= 0.0 {
            return Err(Error::invalid_argument(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Per-request stopping criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoppingCriteria {
    /// Maximum number of generated tokens; 0 means unlimited.
    pub max_new_tokens: usize,
    /// Hard cap on total sequence length (prompt + generated); 0 disables.
    pub max_context_len: usize,
    /// End-of-sequence token id.
    pub eos_token_id: i32,
    /// Ignore the EOS token when set (generation continues past it).
    pub ignore_eos: bool,
    /// Additional stop token ids.
    pub stop_token_ids: HashSet<i32>,
    /// Token-level stop sequences; generation stops when the output ends
    /// with any of them.
    pub stop_sequences: Vec<Vec<i32>>,
}
