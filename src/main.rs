//! infercore demo CLI.
//!
//! Drives the serving core end to end with a mock executor that samples
//! random tokens: synthetic requests go through admission, continuous
//! batching, the paged KV cache and the prefix cache exactly as they would
//! in front of a real model.
//!
//! ```bash
//! infercore --requests 16 --prompt-len 64 --max-new-tokens 128
//! ```

use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use infercore::{
    BatchOutput, ContinuousScheduler, EngineConfig, Executor, ModelInput, Request, SamplingParams,
    SchedulerConfig, StoppingCriteria,
};

const EOS_TOKEN_ID: i32 = 2;
const VOCAB_SIZE: i32 = 32_000;

/// infercore: serving-core demo with a mock executor
#[derive(Parser, Debug)]
#[command(name = "infercore")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of synthetic requests to run
    #[arg(short, long, default_value = "8")]
    requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "32")]
    prompt_len: usize,

    /// Maximum tokens to generate per sequence
    #[arg(long, default_value = "64")]
    max_new_tokens: usize,

    /// Sequences per request (n-sampling)
    #[arg(short = 'n', long, default_value = "1")]
    num_seqs: usize,

    /// Block size for the paged KV cache
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Number of KV cache blocks
    #[arg(long, default_value = "512")]
    num_blocks: usize,

    /// Per-step token budget
    #[arg(long, default_value = "1024")]
    max_tokens_per_batch: usize,

    /// Per-step sequence budget
    #[arg(long, default_value = "128")]
    max_seqs_per_batch: usize,

    /// Probability of sampling EOS at each decode step
    #[arg(long, default_value = "0.02")]
    eos_prob: f64,

    /// Random seed for reproducible runs
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Engine config JSON file (overrides the block flags)
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// Executor stand-in: uniform random tokens with an occasional EOS.
struct MockExecutor {
    rng: StdRng,
    eos_prob: f64,
}

impl Executor for MockExecutor {
    fn execute(&mut self, input: ModelInput) -> BatchOutput {
        let next_tokens = (0..input.num_sequences)
            .map(|_| {
                if self.rng.gen_bool(self.eos_prob) {
                    EOS_TOKEN_ID
                } else {
                    self.rng.gen_range(10..VOCAB_SIZE)
                }
            })
            .collect();
        BatchOutput { next_tokens }
    }

    fn profile_memory(&self) -> (u64, u64) {
        (8 << 30, 16 << 30)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let engine_config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => {
            let config = EngineConfig {
                block_size: args.block_size,
                num_blocks: args.num_blocks,
                ..Default::default()
            };
            config.validate()?;
            config
        }
    };
    let scheduler_config = SchedulerConfig {
        max_tokens_per_batch: args.max_tokens_per_batch,
        max_seqs_per_batch: args.max_seqs_per_batch,
        ..Default::default()
    };
    scheduler_config.validate()?;

    let executor = MockExecutor {
        rng: StdRng::seed_from_u64(args.seed),
        eos_prob: args.eos_prob,
    };
    let (mut scheduler, handle) =
        ContinuousScheduler::new(&engine_config, scheduler_config, executor);

    info!(
        requests = args.requests,
        num_blocks = engine_config.num_blocks,
        block_size = engine_config.block_size,
        "starting demo run"
    );

    // admit all requests up front; completions come back over a channel
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let mut prompt_rng = StdRng::seed_from_u64(args.seed.wrapping_mul(0x9e37_79b9));
    for i in 0..args.requests {
        let prompt_tokens: Vec<i32> = (0..args.prompt_len)
            .map(|_| prompt_rng.gen_range(10..VOCAB_SIZE))
            .collect();
        let done = done_tx.clone();
        let request = Request::new(
            format!("req-{i}"),
            "",
            prompt_tokens,
            SamplingParams::default(),
            StoppingCriteria {
                max_new_tokens: args.max_new_tokens,
                eos_token_id: EOS_TOKEN_ID,
                ..Default::default()
            },
        )
        .with_num_seqs(args.num_seqs)
        .with_on_finish(Box::new(move |result| {
            let _ = done.send(result);
        }));
        handle.submit(request)?;
    }
    drop(done_tx);

    let start = Instant::now();
    let mut processed_tokens = 0usize;
    let mut completion_tokens = 0usize;
    let mut completed = 0usize;
    while completed < args.requests {
        let stats = scheduler.step(Duration::from_millis(50));
        processed_tokens += stats.processed_tokens;

        while let Ok(result) = done_rx.try_recv() {
            completed += 1;
            match result {
                Ok(output) => {
                    completion_tokens += output.usage.completion_tokens;
                    info!(
                        id = %output.id,
                        sequences = output.outputs.len(),
                        completion_tokens = output.usage.completion_tokens,
                        "request finished"
                    );
                }
                Err(err) => warn!(error = %err, "request failed"),
            }
        }
    }
    let elapsed = start.elapsed();

    println!("requests completed:   {completed}");
    println!("tokens processed:     {processed_tokens}");
    println!("tokens generated:     {completion_tokens}");
    println!("elapsed:              {elapsed:.2?}");
    println!(
        "throughput:           {:.0} tokens/sec",
        completion_tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    Ok(())
}
