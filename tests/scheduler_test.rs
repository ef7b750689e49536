//! Integration tests for the continuous-batching scheduler.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use infercore::{
    BatchOutput, ContinuousScheduler, EngineConfig, Error, Executor, FinishReason, ModelInput,
    Priority, Request, RequestOutput, SamplingParams, SchedulerConfig, SchedulerHandle,
    StoppingCriteria,
};

const EOS: i32 = 1;

/// Deterministic executor: records every input and hands out consecutive
/// token ids starting at `first_token`, one per sequence slot per call.
#[derive(Clone)]
struct CountingExecutor {
    calls: Arc<Mutex<Vec<ModelInput>>>,
    next_token: Arc<Mutex<i32>>,
}

impl CountingExecutor {
    fn new(first_token: i32) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            next_token: Arc::new(Mutex::new(first_token)),
        }
    }
}

impl Executor for CountingExecutor {
    fn execute(&mut self, input: ModelInput) -> BatchOutput {
        let num_sequences = input.num_sequences;
        self.calls.lock().push(input);
        let mut next = self.next_token.lock();
        let next_tokens = (0..num_sequences)
            .map(|_| {
                let token = *next;
                *next += 1;
                token
            })
            .collect();
        BatchOutput { next_tokens }
    }

    fn profile_memory(&self) -> (u64, u64) {
        (1 << 30, 1 << 30)
    }
}

type Results = Arc<Mutex<Vec<Result<RequestOutput, Error>>>>;

fn scheduler(
    block_size: usize,
    num_blocks: usize,
    max_tokens: usize,
    max_seqs: usize,
    executor: CountingExecutor,
) -> (ContinuousScheduler<CountingExecutor>, SchedulerHandle) {
    let engine_config = EngineConfig {
        block_size,
        num_blocks,
        ..Default::default()
    };
    let scheduler_config = SchedulerConfig {
        max_tokens_per_batch: max_tokens,
        max_seqs_per_batch: max_seqs,
        intake_capacity: 64,
    };
    ContinuousScheduler::new(&engine_config, scheduler_config, executor)
}

fn request(id: &str, prompt_tokens: Vec<i32>, max_new_tokens: usize, results: &Results) -> Request {
    let results = Arc::clone(results);
    Request::new(
        id,
        "",
        prompt_tokens,
        SamplingParams::default(),
        StoppingCriteria {
            max_new_tokens,
            eos_token_id: EOS,
            ..Default::default()
        },
    )
    .with_on_finish(Box::new(move |result| results.lock().push(result)))
}

#[test]
fn test_single_decode_lifecycle() {
    let executor = CountingExecutor::new(6);
    let calls = Arc::clone(&executor.calls);
    let (mut scheduler, handle) = scheduler(4, 8, 16, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    handle
        .submit(request("a", vec![1, 2, 3, 4, 5], 3, &results))
        .unwrap();

    // step 1: the whole prompt prefills in one go (budget top-up)
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.scheduled_sequences, 1);
    assert_eq!(stats.processed_tokens, 5);
    {
        let calls = calls.lock();
        let input = &calls[0];
        assert_eq!(input.token_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(input.positions, vec![0, 1, 2, 3, 4]);
        assert_eq!(input.q_cu_lens, vec![0, 5]);
        assert_eq!(input.kv_cu_lens, vec![0, 5]);
        assert_eq!(input.new_cache_slots.len(), 5);
        assert_eq!(input.block_tables.len(), 1);
        assert_eq!(input.block_tables[0].len(), 2);
        assert!(input.all_prefill);
    }
    // two blocks allocated for 5 tokens
    assert_eq!(scheduler.block_manager().free_count(), 6);

    // steps 2-3: one decode token each
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.processed_tokens, 1);
    {
        let calls = calls.lock();
        let input = &calls[1];
        assert_eq!(input.token_ids, vec![6]);
        assert_eq!(input.positions, vec![5]);
        assert_eq!(input.kv_cu_lens, vec![0, 6]);
        assert!(!input.all_prefill);
    }
    scheduler.step(Duration::ZERO);

    // carry-over surfaces the completion
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.finished_requests, 1);

    let results = results.lock();
    let output = results[0].as_ref().unwrap();
    assert_eq!(output.outputs[0].token_ids, vec![6, 7, 8]);
    assert_eq!(output.outputs[0].finish_reason, Some(FinishReason::Length));
    assert_eq!(output.usage.prompt_tokens, 5);
    assert_eq!(output.usage.completion_tokens, 3);

    // released: one whole block ([1,2,3,4]) stays cached, the rest is free
    let manager = scheduler.block_manager();
    assert_eq!(manager.num_cached_blocks(), 1);
    assert_eq!(manager.free_count(), 7);
    assert_eq!(manager.free_count() + manager.num_cached_blocks(), 8);
}

#[test]
fn test_prefix_reuse_across_requests() {
    let executor = CountingExecutor::new(6);
    let calls = Arc::clone(&executor.calls);
    let (mut scheduler, handle) = scheduler(4, 8, 16, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    handle
        .submit(request("a", vec![1, 2, 3, 4, 5], 3, &results))
        .unwrap();
    for _ in 0..8 {
        if !results.lock().is_empty() {
            break;
        }
        scheduler.step(Duration::ZERO);
    }
    assert_eq!(results.lock().len(), 1);
    let first_block = calls.lock()[0].block_tables[0][0];

    // same four leading tokens: one block comes from the cache
    handle
        .submit(request("b", vec![1, 2, 3, 4, 9, 10], 1, &results))
        .unwrap();
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.scheduled_sequences, 1);
    // only positions 4-5 are processed
    assert_eq!(stats.processed_tokens, 2);
    {
        let calls = calls.lock();
        let input = calls.last().unwrap();
        assert_eq!(input.token_ids, vec![9, 10]);
        assert_eq!(input.positions, vec![4, 5]);
        assert_eq!(input.kv_cu_lens, vec![0, 6]);
        assert_eq!(input.block_tables[0][0], first_block);
    }

    for _ in 0..8 {
        if results.lock().len() == 2 {
            break;
        }
        scheduler.step(Duration::ZERO);
    }
    assert_eq!(results.lock().len(), 2);
    let manager = scheduler.block_manager();
    assert_eq!(manager.free_count() + manager.num_cached_blocks(), 8);
}

#[test]
fn test_preemption_frees_low_priority_blocks() {
    let executor = CountingExecutor::new(100);
    let calls = Arc::clone(&executor.calls);
    let (mut scheduler, handle) = scheduler(4, 2, 16, 2, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let low = request("low", vec![11, 12, 13, 14], 10, &results).with_priority(Priority::Low);
    handle.submit(low).unwrap();
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.scheduled_sequences, 1);
    assert_eq!(scheduler.block_manager().free_count(), 1);

    // the high-priority prompt needs both blocks: low gets preempted
    let high = request("high", vec![21, 22, 23, 24, 25], 1, &results).with_priority(Priority::High);
    handle.submit(high).unwrap();
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.scheduled_sequences, 1);
    {
        let calls = calls.lock();
        let input = calls.last().unwrap();
        assert_eq!(input.token_ids, vec![21, 22, 23, 24, 25]);
    }

    // high finishes (max_new_tokens = 1); low is re-allocated from scratch
    let mut low_rescheduled = false;
    for _ in 0..8 {
        scheduler.step(Duration::ZERO);
        if let Some(input) = calls.lock().last() {
            if input.token_ids.first() == Some(&11) {
                low_rescheduled = true;
                break;
            }
        }
    }
    assert!(low_rescheduled, "preempted request never came back");

    // low can never fit its full generation in two blocks; it must
    // eventually surface an out-of-memory failure
    for _ in 0..32 {
        if results.lock().len() == 2 {
            break;
        }
        scheduler.step(Duration::ZERO);
    }
    let results = results.lock();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok(), "high-priority request should complete");
    assert!(matches!(results[1], Err(Error::OutOfMemory)));

    let manager = scheduler.block_manager();
    assert_eq!(manager.free_count() + manager.num_cached_blocks(), 2);
}

#[test]
fn test_budget_top_up_extends_prefill() {
    let executor = CountingExecutor::new(500);
    let calls = Arc::clone(&executor.calls);
    let (mut scheduler, handle) = scheduler(4, 16, 10, 5, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let prompt: Vec<i32> = (200..220).collect();
    handle.submit(request("a", prompt, 2, &results)).unwrap();

    // avg budget is 2, but top-up grows the only sequence to the full 10
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.processed_tokens, 10);
    {
        let calls = calls.lock();
        assert_eq!(calls[0].q_cu_lens, vec![0, 10]);
        assert_eq!(calls[0].positions[0], 0);
        assert_eq!(calls[0].positions[9], 9);
    }

    // second prefill chunk covers positions 10..20
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.processed_tokens, 10);
    {
        let calls = calls.lock();
        assert_eq!(calls[1].positions[0], 10);
        assert_eq!(calls[1].positions[9], 19);
        assert!(calls[1].all_prefill);
    }

    // prefill complete: one decode token finishes the request
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.processed_tokens, 1);
}

#[test]
fn test_stream_cancellation_stops_generation() {
    let executor = CountingExecutor::new(50);
    let (mut scheduler, handle) = scheduler(4, 8, 16, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let streamed: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let streamed_cb = Arc::clone(&streamed);
    let reasons: Arc<Mutex<Vec<FinishReason>>> = Arc::new(Mutex::new(Vec::new()));
    let reasons_cb = Arc::clone(&reasons);

    let req = request("s", vec![1, 2, 3], 10, &results).with_stream(Box::new(
        move |_seq_index, delta| {
            let mut streamed = streamed_cb.lock();
            streamed.extend(&delta.token_ids);
            if let Some(reason) = delta.finish_reason {
                reasons_cb.lock().push(reason);
            }
            // decline once three tokens have arrived
            streamed.len() < 3
        },
    ));
    handle.submit(req).unwrap();

    for _ in 0..8 {
        scheduler.step(Duration::ZERO);
        if !results.lock().is_empty() {
            break;
        }
    }

    // the third delta was declined: no further tokens were emitted
    assert_eq!(streamed.lock().as_slice(), &[50, 51, 52]);
    assert_eq!(reasons.lock().as_slice(), &[FinishReason::Cancelled]);

    let results = results.lock();
    let output = results[0].as_ref().unwrap();
    assert_eq!(output.outputs[0].finish_reason, Some(FinishReason::Cancelled));

    // the 3-token prompt is below block granularity: nothing stays cached
    let manager = scheduler.block_manager();
    assert_eq!(manager.num_cached_blocks(), 0);
    assert_eq!(manager.free_count(), 8);
}

#[test]
fn test_liveness_predicate_cancels_request() {
    let executor = CountingExecutor::new(10);
    let (mut scheduler, handle) = scheduler(4, 8, 16, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let alive = Arc::new(Mutex::new(true));
    let alive_cb = Arc::clone(&alive);
    let req = request("l", vec![1, 2, 3, 4], 10, &results)
        .with_liveness(Box::new(move || *alive_cb.lock()));
    handle.submit(req).unwrap();

    scheduler.step(Duration::ZERO);
    *alive.lock() = false;

    for _ in 0..4 {
        scheduler.step(Duration::ZERO);
        if !results.lock().is_empty() {
            break;
        }
    }
    let results = results.lock();
    let output = results[0].as_ref().unwrap();
    assert_eq!(output.outputs[0].finish_reason, Some(FinishReason::Cancelled));
}

#[test]
fn test_priority_order_and_fifo() {
    let executor = CountingExecutor::new(900);
    let calls = Arc::clone(&executor.calls);
    // one sequence per batch forces strict ordering
    let (mut scheduler, handle) = scheduler(4, 16, 16, 1, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    handle
        .submit(request("n1", vec![41, 42], 1, &results))
        .unwrap();
    handle
        .submit(request("h", vec![51, 52], 1, &results).with_priority(Priority::High))
        .unwrap();
    handle
        .submit(request("n2", vec![61, 62], 1, &results))
        .unwrap();

    scheduler.step(Duration::ZERO);
    scheduler.step(Duration::ZERO);
    scheduler.step(Duration::ZERO);

    let calls = calls.lock();
    // high priority first, then normals in arrival order
    assert_eq!(calls[0].token_ids[0], 51);
    assert_eq!(calls[1].token_ids[0], 41);
    assert_eq!(calls[2].token_ids[0], 61);
}

#[test]
fn test_batch_budgets_respected() {
    let executor = CountingExecutor::new(5000);
    let calls = Arc::clone(&executor.calls);
    let (mut scheduler, handle) = scheduler(4, 64, 12, 3, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    for i in 0..6i32 {
        let prompt: Vec<i32> = (100 * i..100 * i + 9).collect();
        handle
            .submit(request(&format!("r{i}"), prompt, 2, &results))
            .unwrap();
    }
    for _ in 0..64 {
        if results.lock().len() == 6 {
            break;
        }
        scheduler.step(Duration::ZERO);
    }
    assert_eq!(results.lock().len(), 6);

    for input in calls.lock().iter() {
        assert!(input.token_ids.len() <= 12, "token budget exceeded");
        assert!(input.num_sequences <= 3, "sequence budget exceeded");
        assert_eq!(input.q_cu_lens.len(), input.num_sequences + 1);
        assert_eq!(
            *input.q_cu_lens.last().unwrap() as usize,
            input.token_ids.len()
        );
    }

    let manager = scheduler.block_manager();
    assert_eq!(manager.free_count() + manager.num_cached_blocks(), 64);
}

#[test]
fn test_sibling_expansion_shares_prompt() {
    let executor = CountingExecutor::new(70);
    let calls = Arc::clone(&executor.calls);
    let (mut scheduler, handle) = scheduler(4, 16, 32, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    // block-aligned prompt so siblings can share it exactly
    let req = request("fanout", vec![1, 2, 3, 4], 2, &results).with_num_seqs(2);
    handle.submit(req).unwrap();

    // step 1: only the first sequence prefills
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.scheduled_sequences, 1);

    // step 2: the sibling exists and rides the cached prompt; the
    // entire-prompt match re-runs exactly the last prompt token
    let stats = scheduler.step(Duration::ZERO);
    assert_eq!(stats.scheduled_sequences, 2);
    {
        let calls = calls.lock();
        let input = calls.last().unwrap();
        // first sequence decodes one token, sibling processes position 3
        assert_eq!(input.q_cu_lens, vec![0, 1, 2]);
        assert!(input.positions.contains(&3));
    }

    for _ in 0..16 {
        if !results.lock().is_empty() {
            break;
        }
        scheduler.step(Duration::ZERO);
    }
    let results = results.lock();
    let output = results[0].as_ref().unwrap();
    assert_eq!(output.outputs.len(), 2);
    assert!(output
        .outputs
        .iter()
        .all(|o| o.finish_reason == Some(FinishReason::Length)));
}

#[test]
fn test_admission_validation() {
    let executor = CountingExecutor::new(0);
    let (_scheduler, handle) = scheduler(4, 8, 16, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let empty = request("bad", vec![], 4, &results);
    assert!(matches!(handle.submit(empty), Err(Error::InvalidArgument(_))));

    let too_long = Request::new(
        "long",
        "",
        (0..32).collect(),
        SamplingParams::default(),
        StoppingCriteria {
            max_new_tokens: 4,
            max_context_len: 16,
            eos_token_id: EOS,
            ..Default::default()
        },
    );
    assert!(matches!(
        handle.submit(too_long),
        Err(Error::InvalidArgument(_))
    ));

    let bad_sampling = Request::new(
        "sampling",
        "",
        vec![1, 2],
        SamplingParams {
            top_p: 2.0,
            ..Default::default()
        },
        StoppingCriteria {
            max_new_tokens: 4,
            eos_token_id: EOS,
            ..Default::default()
        },
    );
    assert!(matches!(
        handle.submit(bad_sampling),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_admission_full() {
    let executor = CountingExecutor::new(0);
    let engine_config = EngineConfig {
        block_size: 4,
        num_blocks: 8,
        ..Default::default()
    };
    let scheduler_config = SchedulerConfig {
        max_tokens_per_batch: 16,
        max_seqs_per_batch: 8,
        intake_capacity: 1,
    };
    let (_scheduler, handle) =
        ContinuousScheduler::new(&engine_config, scheduler_config, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    handle
        .submit(request("first", vec![1, 2], 4, &results))
        .unwrap();
    assert!(matches!(
        handle.submit(request("second", vec![3, 4], 4, &results)),
        Err(Error::AdmissionFull)
    ));
}

#[test]
fn test_eos_finishes_with_stop() {
    // the executor emits EOS on its first decode step
    let executor = CountingExecutor::new(EOS);
    let (mut scheduler, handle) = scheduler(4, 8, 16, 8, executor);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    handle
        .submit(request("eos", vec![7, 8, 9], 16, &results))
        .unwrap();
    for _ in 0..8 {
        if !results.lock().is_empty() {
            break;
        }
        scheduler.step(Duration::ZERO);
    }
    let results = results.lock();
    let output = results[0].as_ref().unwrap();
    assert_eq!(output.outputs[0].finish_reason, Some(FinishReason::Stop));
    assert_eq!(output.outputs[0].token_ids, vec![EOS]);
}

#[test]
fn test_idle_step_times_out() {
    let executor = CountingExecutor::new(0);
    let (mut scheduler, _handle) = scheduler(4, 8, 16, 8, executor);

    let start = std::time::Instant::now();
    let stats = scheduler.step(Duration::from_millis(20));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert_eq!(stats.scheduled_sequences, 0);
    assert!(!scheduler.has_pending_work());
}
