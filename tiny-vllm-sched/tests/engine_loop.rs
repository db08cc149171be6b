use std::thread;

use anyhow::Result;
use ndarray::Array2;
use tiny_vllm_sched::{
    BatchDescriptor, BatchOutput, CompletionSender, DisaggConfig, Executor, FinishReason, LlmEngine,
    LoopbackTransport, ManualClock, Request, SamplingParams, Scheduler, SchedulerConfig, SequenceOutput,
    SequencePhase, SpeculativeConfig, StepKind, TokenId,
};

const VOCAB: usize = 8;

/// Toy model: the token after `t` is `t % 3 + 1`.
fn next_token(t: TokenId) -> TokenId {
    t % 3 + 1
}

/// Row `i` predicts the token after `input_tokens[i]` for decodes, and after
/// the last prompt chunk token for prefills.
fn cyclic_output(batch: &BatchDescriptor) -> BatchOutput {
    let outputs = batch
        .sequences
        .iter()
        .filter(|s| s.samples)
        .map(|s| {
            let context: Vec<TokenId> = match s.kind {
                StepKind::Decode => s.input_tokens.clone(),
                StepKind::Prefill => s.input_tokens.last().copied().into_iter().collect(),
            };
            let mut logits = Array2::zeros((context.len(), VOCAB));
            for (row, &t) in context.iter().enumerate() {
                logits[[row, next_token(t) as usize]] = 1.0;
            }
            SequenceOutput { request_id: s.request_id, logits }
        })
        .collect();
    BatchOutput { batch_id: batch.batch_id, outputs }
}

/// Answers synchronously, before `execute` returns.
#[derive(Default)]
struct InlineExecutor {
    launched: usize,
}

impl Executor for InlineExecutor {
    fn execute(&mut self, batch: &BatchDescriptor, done: CompletionSender) -> Result<()> {
        self.launched += 1;
        done.send(cyclic_output(batch))?;
        Ok(())
    }
}

/// Answers from a worker thread per batch.
struct ThreadedExecutor;

impl Executor for ThreadedExecutor {
    fn execute(&mut self, batch: &BatchDescriptor, done: CompletionSender) -> Result<()> {
        let output = cyclic_output(batch);
        thread::spawn(move || {
            let _ = done.send(output);
        });
        Ok(())
    }
}

fn prompt(len: usize) -> Vec<TokenId> {
    (0..len).map(|i| (i % 3) as TokenId + 1).collect()
}

fn scheduler(config: SchedulerConfig) -> Scheduler {
    Scheduler::builder(config).clock(ManualClock::new()).build().unwrap()
}

#[test]
fn threaded_executor_drives_requests_to_completion() {
    let config = SchedulerConfig::default().with_blocks(64, 4);
    let mut engine = LlmEngine::new(scheduler(config), ThreadedExecutor).with_max_in_flight(2);

    let ids: Vec<_> = [(5, 6), (9, 3), (2, 8), (13, 1)]
        .into_iter()
        .map(|(len, max)| engine.submit(Request::new(prompt(len), SamplingParams::greedy(max))).unwrap())
        .collect();

    let mut outputs = engine.run_until_idle(500).unwrap();
    outputs.sort_by_key(|o| o.request_id);

    assert_eq!(outputs.iter().map(|o| o.request_id).collect::<Vec<_>>(), ids);
    for (out, max) in outputs.iter().zip([6, 3, 8, 1]) {
        assert_eq!(out.phase, SequencePhase::Finished);
        assert_eq!(out.finish_reason, Some(FinishReason::Length));
        assert_eq!(out.completion_token_ids.len(), max);
        // every generated token follows the toy model from its predecessor
        for pair in out.all_token_ids[out.prompt_token_count - 1..].windows(2) {
            assert_eq!(pair[1], next_token(pair[0]));
        }
    }
    assert!(engine.scheduler().is_idle());
    assert_eq!(engine.scheduler().block_stats().free_blocks, 64);
}

#[test]
fn cancel_mid_generation_releases_blocks() {
    let config = SchedulerConfig::default().with_blocks(32, 4);
    let mut engine = LlmEngine::new(scheduler(config), InlineExecutor::default()).with_max_in_flight(1);
    let long = engine.submit(Request::new(prompt(6), SamplingParams::greedy(50))).unwrap();
    let short = engine.submit(Request::new(prompt(4), SamplingParams::greedy(3))).unwrap();

    for _ in 0..3 {
        engine.step().unwrap();
    }
    engine.cancel(long).unwrap();

    let mut outputs = engine.run_until_idle(200).unwrap();
    outputs.sort_by_key(|o| o.request_id);
    assert_eq!(outputs.len(), 2);

    assert_eq!(outputs[0].request_id, long);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Cancelled));
    assert!(outputs[0].completion_token_ids.len() < 50);

    assert_eq!(outputs[1].request_id, short);
    assert_eq!(outputs[1].completion_token_ids.len(), 3);
    assert_eq!(engine.scheduler().block_stats().free_blocks, 32);
}

#[test]
fn speculation_on_repetitive_text_takes_fewer_batches() {
    let spec = SpeculativeConfig { num_speculative_tokens: 3, ..Default::default() };
    let config = SchedulerConfig::default().with_blocks(32, 4).with_speculative(spec);
    let mut engine = LlmEngine::new(scheduler(config), InlineExecutor::default()).with_max_in_flight(1);
    engine.submit(Request::new(vec![1, 2, 3, 1, 2, 3, 1, 2], SamplingParams::greedy(10))).unwrap();

    let outputs = engine.run_until_idle(100).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].completion_token_ids, vec![3, 1, 2, 3, 1, 2, 3, 1, 2, 3]);

    let stats = engine.scheduler().spec_decode_stats().unwrap();
    assert!(stats.proposed_tokens > 0);
    assert_eq!(stats.accepted_tokens, stats.proposed_tokens);
    assert!(engine.executor().launched < 10);
}

#[test]
fn remote_prefill_waits_for_kv_handoff() {
    let transport = LoopbackTransport::new();
    let remote = transport.remote();
    let disagg = DisaggConfig { transfer_timeout_ms: 1_000, max_local_prefill_len: 8 };
    let config = SchedulerConfig::default().with_blocks(32, 4).with_disagg(disagg);
    let sched = Scheduler::builder(config).clock(ManualClock::new()).transport(transport).build().unwrap();
    let mut engine = LlmEngine::new(sched, InlineExecutor::default()).with_max_in_flight(1);

    let id = engine.submit(Request::new(prompt(20), SamplingParams::greedy(4))).unwrap();
    let first = engine.step().unwrap();
    assert_eq!(first.launched.as_ref().and_then(|b| b.get(id)).map(|s| s.kind), Some(StepKind::Prefill));

    // prefill output applied, handoff opened, nothing runnable yet
    let waiting = engine.step().unwrap();
    assert!(waiting.launched.is_none());
    assert_eq!(engine.status(id).unwrap().phase, SequencePhase::Prefilling);
    assert_eq!(remote.pending().len(), 1);

    assert_eq!(remote.deliver_all(), 1);
    let resumed = engine.step().unwrap();
    assert_eq!(resumed.launched.as_ref().and_then(|b| b.get(id)).map(|s| s.kind), Some(StepKind::Decode));
    assert_eq!(engine.status(id).unwrap().phase, SequencePhase::Decoding);

    let outputs = engine.run_until_idle(50).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].completion_token_ids.len(), 4);
    assert_eq!(engine.scheduler().block_stats().free_blocks, 32);
}
