//! Scheduler for managing sequence execution and batching.
//!
//! One call to [`Scheduler::tick`] produces one [`BatchDescriptor`]. Within a
//! tick every mutation of the block pool, the sequence table and the waiting
//! queue happens here, on one thread, in a fixed order:
//!
//! 1. apply client cancellations,
//! 2. resolve finished or expired KV handoffs,
//! 3. continue running requests (decode steps and remaining prefill chunks),
//!    preempting victims when a request cannot grow its block table,
//! 4. admit waiting requests,
//! 5. split the batch for dual-batch overlap and pin its blocks.
//!
//! Batches run asynchronously. Their blocks stay pinned, and their requests
//! stay out of later batches, until [`Scheduler::complete`] is called.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;

use anyhow::bail;
use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::admission::{AdmissionQueue, CapacityBudget, QueueEntry};
use crate::engine::block_manager::{BlockCopy, BlockId, BlockManager, BlockManagerStats, BlockTable};
use crate::engine::dbo::{DualBatchOverlap, MicroBatch, OverlapPlan};
use crate::engine::disagg::{DisaggCoordinator, HandoffStatus, KvTransport};
use crate::engine::preemption::{PreemptionManager, VictimCandidate};
use crate::engine::sampler::{GreedyPolicy, SamplingPolicy};
use crate::engine::sequence::{
    FinishReason, Request, RequestId, RequestOutput, RequestStatus, Sequence, SequencePhase,
    SequenceTracker, TokenId,
};
use crate::engine::speculative::{self, SpecDecodeStats, SpeculativeCoordinator};
use crate::error::{Result, SchedulerError};
use crate::utils::clock::{Clock, MonotonicClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepKind {
    Prefill,
    Decode,
}

/// One request's share of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledSequence {
    pub request_id: RequestId,
    pub kind: StepKind,
    /// Position of the first token computed in this step.
    pub start_pos: usize,
    /// Tokens fed to the model in this step.
    pub input_tokens: Vec<TokenId>,
    /// Proposed continuation to verify; empty for plain decode.
    pub speculative_tokens: Vec<TokenId>,
    pub block_table: Vec<BlockId>,
    pub block_copies: Vec<BlockCopy>,
    /// Whether the executor must return logits for this sequence: one row for
    /// a final prefill chunk, `1 + speculative_tokens.len()` rows for decode.
    pub samples: bool,
    pub micro_batch: MicroBatch,
}

impl ScheduledSequence {
    pub fn num_tokens(&self) -> usize {
        self.input_tokens.len()
    }
}

/// Output of one scheduling tick.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDescriptor {
    pub batch_id: u64,
    pub tick: u64,
    pub sequences: Vec<ScheduledSequence>,
    pub overlap: OverlapPlan,
    /// Requests sent back to the waiting queue this tick.
    pub preempted: Vec<RequestId>,
    /// Requests whose KV handoff failed or timed out and will prefill again.
    pub retried_handoffs: Vec<RequestId>,
}

impl BatchDescriptor {
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn num_tokens(&self) -> usize {
        self.sequences.iter().map(ScheduledSequence::num_tokens).sum()
    }

    pub fn get(&self, id: RequestId) -> Option<&ScheduledSequence> {
        self.sequences.iter().find(|s| s.request_id == id)
    }

    pub fn micro_batch(&self, mb: MicroBatch) -> impl Iterator<Item = &ScheduledSequence> {
        self.sequences.iter().filter(move |s| s.micro_batch == mb)
    }

    /// Every block copy the executor must perform before running the batch.
    pub fn block_copies(&self) -> impl Iterator<Item = &BlockCopy> {
        self.sequences.iter().flat_map(|s| s.block_copies.iter())
    }
}

/// Logits returned by the executor for one sequence.
#[derive(Debug, Clone)]
pub struct SequenceOutput {
    pub request_id: RequestId,
    pub logits: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub batch_id: u64,
    pub outputs: Vec<SequenceOutput>,
}

#[derive(Debug, Default)]
struct Draft {
    entries: Vec<ScheduledSequence>,
    admitted: HashSet<RequestId>,
    preempted: Vec<RequestId>,
    tokens_left: usize,
}

impl Draft {
    fn push(&mut self, entry: ScheduledSequence) {
        self.tokens_left = self.tokens_left.saturating_sub(entry.num_tokens());
        self.entries.push(entry);
    }

    fn drop_entry(&mut self, id: RequestId) {
        let mut returned = 0;
        self.entries.retain(|e| {
            let keep = e.request_id != id;
            if !keep {
                returned += e.num_tokens();
            }
            keep
        });
        self.tokens_left += returned;
        self.admitted.remove(&id);
    }
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Box<dyn Clock>,
    policy: Box<dyn SamplingPolicy + Send>,
    transport: Option<Box<dyn KvTransport + Send>>,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Policy used to check speculative tokens and pick the first token after
    /// prefill. Greedy by default.
    pub fn sampling_policy(mut self, policy: impl SamplingPolicy + Send + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn transport(mut self, transport: impl KvTransport + Send + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn build(self) -> anyhow::Result<Scheduler> {
        self.config.validate()?;
        let disagg = match (self.config.disagg.clone(), self.transport) {
            (Some(cfg), Some(transport)) => Some(DisaggCoordinator::new(cfg, transport)),
            (Some(_), None) => bail!("disaggregated prefill is configured but no KV transport was given"),
            (None, _) => None,
        };
        let cfg = self.config;
        Ok(Scheduler {
            blocks: BlockManager::new(cfg.num_kvcache_blocks, cfg.kvcache_block_size),
            seqs: SequenceTracker::new(),
            waiting: AdmissionQueue::new(),
            preemption: PreemptionManager::new(cfg.preemption.clone()),
            speculative: cfg.speculative.as_ref().map(SpeculativeCoordinator::new),
            dbo: DualBatchOverlap::new(cfg.dbo.clone()),
            disagg,
            clock: self.clock,
            policy: self.policy,
            tick: 0,
            next_batch_id: 0,
            in_flight: HashMap::new(),
            pending_cancel: BTreeSet::new(),
            finished: Vec::new(),
            config: cfg,
        })
    }
}

/// Core scheduler responsible for batching sequences.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: Box<dyn Clock>,
    policy: Box<dyn SamplingPolicy + Send>,
    blocks: BlockManager,
    seqs: SequenceTracker,
    waiting: AdmissionQueue,
    preemption: PreemptionManager,
    speculative: Option<SpeculativeCoordinator>,
    disagg: Option<DisaggCoordinator>,
    dbo: DualBatchOverlap,
    tick: u64,
    next_batch_id: u64,
    in_flight: HashMap<u64, Vec<ScheduledSequence>>,
    pending_cancel: BTreeSet<RequestId>,
    finished: Vec<RequestOutput>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick", &self.tick)
            .field("live", &self.seqs.len())
            .field("waiting", &self.waiting.len())
            .field("in_flight", &self.in_flight.len())
            .field("blocks", &self.blocks.get_stats())
            .finish()
    }
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            clock: Box::new(MonotonicClock::default()),
            policy: Box::new(GreedyPolicy),
            transport: None,
        }
    }

    /// Create a scheduler with a wall clock and greedy verification.
    pub fn new(config: SchedulerConfig) -> anyhow::Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn block_stats(&self) -> BlockManagerStats {
        self.blocks.get_stats()
    }

    pub fn spec_decode_stats(&self) -> Option<SpecDecodeStats> {
        self.speculative.as_ref().map(SpeculativeCoordinator::stats)
    }

    pub fn sequence(&self, id: RequestId) -> Option<&Sequence> {
        self.seqs.get(id)
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// No live requests and no batch outstanding.
    pub fn is_idle(&self) -> bool {
        self.seqs.is_empty() && self.in_flight.is_empty()
    }

    fn eos_token(&self) -> Option<TokenId> {
        (self.config.eos >= 0).then_some(self.config.eos)
    }

    // ---------------------------------------------------------------------
    // Client surface
    // ---------------------------------------------------------------------

    /// Validate and enqueue a request.
    pub fn submit(&mut self, request: Request) -> Result<RequestId> {
        if request.prompt.is_empty() {
            return Err(SchedulerError::InvalidRequest("empty prompt".into()));
        }
        request.sampling.validate()?;
        let total = request.prompt.len() + request.sampling.max_tokens;
        if total > self.config.max_model_len {
            return Err(SchedulerError::InvalidRequest(format!(
                "prompt ({}) plus max_tokens ({}) exceeds max_model_len ({})",
                request.prompt.len(),
                request.sampling.max_tokens,
                self.config.max_model_len
            )));
        }
        let needed = self.blocks.blocks_needed(request.prompt.len() + 1);
        if needed > self.blocks.num_blocks() {
            return Err(SchedulerError::InvalidRequest(format!(
                "prompt needs {needed} blocks but the pool holds {}",
                self.blocks.num_blocks()
            )));
        }

        let prompt_len = request.prompt.len();
        let priority = request.priority;
        let id = self.seqs.create(request, self.clock.now_ms());
        let entry = self.queue_entry(id)?;
        self.waiting.push(entry);
        info!(request_id = id, prompt_len, priority, "request submitted");
        Ok(id)
    }

    /// Cancellation takes effect at the start of the next tick.
    pub fn cancel(&mut self, id: RequestId) -> Result<()> {
        if !self.seqs.contains(id) {
            return Err(SchedulerError::UnknownRequest(id));
        }
        self.pending_cancel.insert(id);
        Ok(())
    }

    /// Phase and progress of a live request, or of a finished one whose output
    /// has not been drained yet.
    pub fn status(&self, id: RequestId) -> Result<RequestStatus> {
        if let Some(seq) = self.seqs.get(id) {
            return Ok(seq.status());
        }
        self.finished
            .iter()
            .find(|o| o.request_id == id)
            .map(|o| RequestStatus { phase: o.phase, generated_tokens: o.completion_token_ids.len() })
            .ok_or(SchedulerError::UnknownRequest(id))
    }

    /// Clone a request into a parallel-sampling branch. A decoding request
    /// shares its blocks with the branch copy-on-write.
    pub fn fork(&mut self, id: RequestId) -> Result<RequestId> {
        let parent = self.seqs.get(id).ok_or(SchedulerError::UnknownRequest(id))?;
        let phase = parent.phase();
        if parent.is_in_flight()
            || self.is_transferring(id)
            || !matches!(phase, SequencePhase::Waiting | SequencePhase::Decoding)
        {
            return Err(SchedulerError::InvalidRequest(format!(
                "request {id} cannot be forked while {phase:?}"
            )));
        }
        let mut child = parent.clone();
        let child_id = self.seqs.next_id();
        child.id = child_id;
        if phase == SequencePhase::Decoding {
            self.blocks.fork(id, child_id)?;
        }
        self.seqs.insert(child);
        if phase == SequencePhase::Waiting {
            let entry = self.queue_entry(child_id)?;
            self.waiting.push(entry);
        }
        debug!(request_id = id, child = child_id, "request forked");
        Ok(child_id)
    }

    /// Outputs of requests that finished or failed since the last call.
    pub fn drain_finished(&mut self) -> Vec<RequestOutput> {
        std::mem::take(&mut self.finished)
    }

    // ---------------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------------

    /// Run one scheduling step. An empty batch is not registered and needs
    /// no [`complete`](Self::complete).
    pub fn tick(&mut self) -> Result<BatchDescriptor> {
        match self.tick_inner() {
            Err(e) if e.is_fatal() => Err(self.on_fatal(e)),
            other => other,
        }
    }

    fn tick_inner(&mut self) -> Result<BatchDescriptor> {
        self.tick += 1;
        let now = self.clock.now_ms();

        self.apply_cancellations()?;
        let retried_handoffs = self.resolve_handoffs(now)?;

        let mut draft = Draft { tokens_left: self.config.max_num_batched_tokens, ..Default::default() };
        self.schedule_running(&mut draft)?;
        self.schedule_waiting(&mut draft)?;

        if cfg!(debug_assertions) {
            self.blocks.audit()?;
        }
        Ok(self.finalize(draft, retried_handoffs))
    }

    fn apply_cancellations(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.pending_cancel) {
            let Some(seq) = self.seqs.get_mut(id) else { continue };
            seq.fail(FinishReason::Cancelled);
            if let Some(disagg) = self.disagg.as_mut() {
                disagg.cancel(id);
            }
            self.blocks.free(id)?;
            info!(request_id = id, "request cancelled");
            self.retire(id);
        }
        Ok(())
    }

    fn resolve_handoffs(&mut self, now: u64) -> Result<Vec<RequestId>> {
        let resolved = match self.disagg.as_mut() {
            Some(disagg) => disagg.poll_all(now),
            None => return Ok(Vec::new()),
        };
        let mut retried = Vec::new();
        for (id, status) in resolved {
            let Some(seq) = self.seqs.get_mut(id) else { continue };
            let err = match status {
                HandoffStatus::Pending => continue,
                HandoffStatus::Complete(table)
                    if self.blocks.table(id).map(BlockTable::blocks) == Some(table.blocks()) =>
                {
                    seq.set_phase(SequencePhase::Decoding);
                    continue;
                }
                HandoffStatus::Complete(_) => SchedulerError::TransferFailed {
                    request_id: id,
                    reason: "handoff block table does not match the allocator".into(),
                },
                HandoffStatus::Failed(err) => err,
            };
            warn!(request_id = id, "prefilling again after failed handoff: {err}");
            seq.num_computed = 0;
            seq.remote_prefill = false;
            seq.set_phase(SequencePhase::Waiting);
            self.blocks.free(id)?;
            let entry = self.queue_entry(id)?;
            self.waiting.requeue(entry);
            retried.push(id);
        }
        Ok(retried)
    }

    fn is_transferring(&self, id: RequestId) -> bool {
        self.disagg.as_ref().is_some_and(|d| d.handle(id).is_some())
    }

    fn is_schedulable(&self, seq: &Sequence) -> bool {
        matches!(seq.phase(), SequencePhase::Prefilling | SequencePhase::Decoding)
            && !seq.is_in_flight()
            && !self.is_transferring(seq.id())
    }

    /// Running requests eligible this tick, highest priority and oldest first.
    fn runnable(&self) -> Vec<RequestId> {
        let mut runnable: Vec<&Sequence> = self.seqs.iter().filter(|s| self.is_schedulable(s)).collect();
        runnable.sort_by_key(|s| (std::cmp::Reverse(s.priority()), s.arrival_ms(), s.id()));
        runnable.into_iter().map(Sequence::id).collect()
    }

    fn schedule_running(&mut self, draft: &mut Draft) -> Result<()> {
        let runnable = self.runnable();
        let num_decoding = runnable
            .iter()
            .filter(|&&id| self.seqs.get(id).is_some_and(|s| s.phase() == SequencePhase::Decoding))
            .count();
        let speculate = self.speculative.as_ref().is_some_and(|s| s.should_speculate(num_decoding));

        for id in runnable {
            if draft.entries.len() >= self.config.max_num_seqs || draft.tokens_left == 0 {
                break;
            }
            let Some(seq) = self.seqs.get(id) else { continue };
            let entry = match seq.phase() {
                SequencePhase::Decoding => self.plan_decode(seq, speculate, draft.tokens_left),
                SequencePhase::Prefilling => match self.plan_prefill(seq, draft.tokens_left) {
                    Some(entry) => entry,
                    None => continue,
                },
                // preempted earlier in this loop
                _ => continue,
            };

            let target = self.reserve_target(seq, &entry);
            let write = entry.start_pos..entry.start_pos + entry.num_tokens();
            match self.reserve(id, target, write, draft)? {
                Some(copies) => draft.push(ScheduledSequence { block_copies: copies, ..entry }),
                None => self.evict_self(id, target, draft)?,
            }
        }
        Ok(())
    }

    fn plan_prefill(&self, seq: &Sequence, tokens_left: usize) -> Option<ScheduledSequence> {
        let remaining = seq.num_uncomputed();
        if remaining > tokens_left && !self.config.enable_chunked_prefill {
            return None;
        }
        let chunk = remaining.min(tokens_left);
        if chunk == 0 {
            return None;
        }
        let start = seq.num_computed();
        Some(ScheduledSequence {
            request_id: seq.id(),
            kind: StepKind::Prefill,
            start_pos: start,
            input_tokens: seq.all_tokens()[start..start + chunk].to_vec(),
            speculative_tokens: Vec::new(),
            block_table: Vec::new(),
            block_copies: Vec::new(),
            samples: chunk == remaining,
            micro_batch: MicroBatch::A,
        })
    }

    fn plan_decode(&self, seq: &Sequence, speculate: bool, tokens_left: usize) -> ScheduledSequence {
        // candidates past the output budget would be truncated anyway
        let remaining_output = seq.sampling().max_tokens.saturating_sub(seq.completion_token_count());
        let limit = remaining_output.saturating_sub(1).min(tokens_left.saturating_sub(1));
        let speculative_tokens: Vec<TokenId> = match &self.speculative {
            Some(spec) if speculate => spec.propose(seq.all_tokens()).take(limit).collect(),
            _ => Vec::new(),
        };
        let start = seq.len() - 1;
        let mut input_tokens = Vec::with_capacity(1 + speculative_tokens.len());
        input_tokens.push(seq.all_tokens()[start]);
        input_tokens.extend_from_slice(&speculative_tokens);
        ScheduledSequence {
            request_id: seq.id(),
            kind: StepKind::Decode,
            start_pos: start,
            input_tokens,
            speculative_tokens,
            block_table: Vec::new(),
            block_copies: Vec::new(),
            samples: true,
            micro_batch: MicroBatch::A,
        }
    }

    /// Token slots the table must cover once this step's output is appended.
    fn reserve_target(&self, seq: &Sequence, entry: &ScheduledSequence) -> usize {
        let target = match entry.kind {
            StepKind::Prefill => entry.start_pos + entry.num_tokens() + usize::from(entry.samples),
            StepKind::Decode => seq.len() + entry.speculative_tokens.len() + 1,
        };
        target.max(seq.len())
    }

    fn try_reserve(&mut self, id: RequestId, num_tokens: usize, write: Range<usize>) -> Result<Vec<BlockCopy>> {
        self.blocks.ensure_capacity(id, num_tokens)?;
        self.blocks.prepare_write(id, write.start, write.end)
    }

    /// Grow `id`'s table to `num_tokens` slots and make `write` private,
    /// preempting other running requests on the first shortfall. `None` if it
    /// still does not fit.
    fn reserve(
        &mut self,
        id: RequestId,
        num_tokens: usize,
        write: Range<usize>,
        draft: &mut Draft,
    ) -> Result<Option<Vec<BlockCopy>>> {
        for attempt in 0..2 {
            match self.try_reserve(id, num_tokens, write.clone()) {
                Ok(copies) => return Ok(Some(copies)),
                Err(SchedulerError::OutOfMemory { requested, available }) if attempt == 0 => {
                    let deficit = requested.saturating_sub(available).max(1);
                    let Some(requester) = self.seqs.get(id).map(|s| self.victim_candidate(s)) else {
                        break;
                    };
                    let candidates: Vec<VictimCandidate> = self
                        .victim_candidates(id, draft, false)
                        .into_iter()
                        .filter(|victim| self.preemption.may_reclaim_from(&requester, victim))
                        .collect();
                    let victims = self.preemption.select_victims(deficit, &candidates);
                    if victims.is_empty() {
                        break;
                    }
                    debug!(request_id = id, deficit, ?victims, "preempting to grow block table");
                    for victim in victims {
                        self.preempt(victim, draft)?;
                    }
                }
                Err(SchedulerError::OutOfMemory { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// A running request that cannot grow goes back to waiting, or fails when
    /// the whole pool could never hold it.
    fn evict_self(&mut self, id: RequestId, num_tokens: usize, draft: &mut Draft) -> Result<()> {
        let requested = self.blocks.blocks_needed(num_tokens);
        if requested <= self.blocks.num_blocks() {
            return self.preempt(id, draft);
        }
        let err = SchedulerError::OutOfMemory { requested, available: self.blocks.num_blocks() };
        error!(request_id = id, "request outgrew the KV cache: {err}");
        draft.drop_entry(id);
        if let Some(seq) = self.seqs.get_mut(id) {
            seq.fail(FinishReason::Error(err.to_string()));
        }
        self.blocks.free(id)?;
        self.retire(id);
        Ok(())
    }

    fn victim_candidate(&self, seq: &Sequence) -> VictimCandidate {
        VictimCandidate {
            id: seq.id(),
            phase: seq.phase(),
            priority: seq.priority(),
            preemption_count: seq.preemption_count(),
            last_scheduled_tick: seq.last_scheduled_tick,
            arrival_ms: seq.arrival_ms(),
            reclaimable_blocks: self.blocks.reclaimable_blocks(seq.id()),
        }
    }

    /// Running requests other than `requester` whose blocks are not pinned by
    /// an in-flight batch or a pending handoff.
    fn victim_candidates(&self, requester: RequestId, draft: &Draft, skip_admitted: bool) -> Vec<VictimCandidate> {
        self.seqs
            .iter()
            .filter(|s| s.id() != requester && self.is_schedulable(s))
            .filter(|s| !(skip_admitted && draft.admitted.contains(&s.id())))
            .map(|s| self.victim_candidate(s))
            .collect()
    }

    fn preempt(&mut self, id: RequestId, draft: &mut Draft) -> Result<()> {
        draft.drop_entry(id);
        self.blocks.free(id)?;
        let Some(seq) = self.seqs.get_mut(id) else {
            return Ok(());
        };
        seq.preempt();
        info!(request_id = id, preemptions = seq.preemption_count(), "request preempted");
        let entry = self.queue_entry(id)?;
        self.waiting.requeue(entry);
        draft.preempted.push(id);
        Ok(())
    }

    fn queue_entry(&self, id: RequestId) -> Result<QueueEntry> {
        let seq = self.seqs.get(id).ok_or(SchedulerError::UnknownRequest(id))?;
        Ok(QueueEntry {
            id,
            priority: seq.priority(),
            arrival_ms: seq.arrival_ms(),
            min_blocks: self.blocks.blocks_needed(seq.len() + 1),
            num_tokens: seq.len(),
        })
    }

    fn schedule_waiting(&mut self, draft: &mut Draft) -> Result<()> {
        let budget = CapacityBudget {
            max_seqs: self.config.max_num_seqs.saturating_sub(draft.entries.len()),
            max_tokens: draft.tokens_left,
            free_blocks: self.blocks.num_free(),
            chunked_prefill: self.config.enable_chunked_prefill,
        };
        if budget.max_seqs == 0 || budget.max_tokens == 0 || self.waiting.is_empty() {
            return Ok(());
        }

        let plan = self.waiting.next_batch(budget);
        for &id in &plan.admitted {
            // requests preempted this tick wait at least one tick
            if draft.preempted.contains(&id) {
                continue;
            }
            self.admit(id, draft)?;
        }

        if !self.preemption.allows_admission_preemption() {
            return Ok(());
        }
        if let Some(&id) = plan.skipped.iter().find(|id| !draft.preempted.contains(id)) {
            self.admit_by_preemption(id, draft)?;
        }
        Ok(())
    }

    fn has_room(&self, draft: &Draft) -> bool {
        draft.entries.len() < self.config.max_num_seqs && draft.tokens_left > 0
    }

    /// Allocate blocks for a waiting request and schedule its first prefill
    /// chunk. Returns false, leaving it queued, if it does not fit.
    fn admit(&mut self, id: RequestId, draft: &mut Draft) -> Result<bool> {
        if !self.has_room(draft) {
            return Ok(false);
        }
        let Some(seq) = self.seqs.get(id) else {
            self.waiting.remove(id);
            return Ok(false);
        };
        let alloc = match self.blocks.allocate_prefix(id, seq.all_tokens()) {
            Ok(alloc) => alloc,
            Err(SchedulerError::OutOfMemory { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let remote = self
            .disagg
            .as_ref()
            .is_some_and(|d| d.should_prefill_remote(seq.len(), alloc.cached_tokens));

        if let Some(seq) = self.seqs.get_mut(id) {
            seq.num_computed = alloc.cached_tokens;
            seq.remote_prefill = remote;
        }
        let Some(seq) = self.seqs.get(id) else {
            return Ok(false);
        };
        let Some(entry) = self.plan_prefill(seq, draft.tokens_left) else {
            self.undo_admission(id)?;
            return Ok(false);
        };
        let target = self.reserve_target(seq, &entry);
        let write = entry.start_pos..entry.start_pos + entry.num_tokens();
        let copies = match self.try_reserve(id, target, write) {
            Ok(copies) => copies,
            Err(SchedulerError::OutOfMemory { .. }) => {
                self.undo_admission(id)?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.waiting.remove(id);
        if let Some(seq) = self.seqs.get_mut(id) {
            seq.set_phase(SequencePhase::Prefilling);
        }
        debug!(
            request_id = id,
            cached_tokens = alloc.cached_tokens,
            remote,
            chunk = entry.num_tokens(),
            "request admitted"
        );
        draft.admitted.insert(id);
        draft.push(ScheduledSequence { block_copies: copies, ..entry });
        Ok(true)
    }

    fn undo_admission(&mut self, id: RequestId) -> Result<()> {
        self.blocks.free(id)?;
        if let Some(seq) = self.seqs.get_mut(id) {
            seq.num_computed = 0;
            seq.remote_prefill = false;
        }
        Ok(())
    }

    /// Try to admit the head skipped candidate by displacing running requests
    /// it outranks. Requests admitted earlier in the same tick are off limits.
    fn admit_by_preemption(&mut self, id: RequestId, draft: &mut Draft) -> Result<()> {
        if !self.has_room(draft) {
            return Ok(());
        }
        let Some(seq) = self.seqs.get(id) else {
            return Ok(());
        };
        let requester = self.victim_candidate(seq);
        let deficit = self.blocks.blocks_needed(seq.len() + 1).saturating_sub(self.blocks.num_free());
        if deficit > 0 {
            let candidates: Vec<VictimCandidate> = self
                .victim_candidates(id, draft, true)
                .into_iter()
                .filter(|victim| self.preemption.may_displace(&requester, victim))
                .collect();
            let victims = self.preemption.select_victims(deficit, &candidates);
            if victims.is_empty() {
                return Ok(());
            }
            debug!(request_id = id, deficit, ?victims, "preempting to admit");
            for victim in victims {
                self.preempt(victim, draft)?;
            }
        }
        self.admit(id, draft)?;
        Ok(())
    }

    fn finalize(&mut self, draft: Draft, retried_handoffs: Vec<RequestId>) -> BatchDescriptor {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut sequences = draft.entries;
        // decodes first, so a split falls between short and long work
        sequences.sort_by_key(|s| s.kind == StepKind::Prefill);
        let costs: Vec<usize> = sequences.iter().map(ScheduledSequence::num_tokens).collect();
        let overlap = self.dbo.partition(&costs);

        for (pos, entry) in sequences.iter_mut().enumerate() {
            entry.micro_batch = overlap.micro_batch_of(pos);
            entry.block_table =
                self.blocks.table(entry.request_id).map(|t| t.blocks().to_vec()).unwrap_or_default();
            if let Some(seq) = self.seqs.get_mut(entry.request_id) {
                seq.in_flight = Some(batch_id);
                seq.last_scheduled_tick = Some(self.tick);
            }
        }
        if !sequences.is_empty() {
            let ids: Vec<RequestId> = sequences.iter().map(|s| s.request_id).collect();
            self.blocks.mark_in_use(batch_id, &ids);
            self.in_flight.insert(batch_id, sequences.clone());
        }

        debug!(
            tick = self.tick,
            batch_id,
            seqs = sequences.len(),
            tokens = costs.iter().sum::<usize>(),
            split = overlap.is_split(),
            free_blocks = self.blocks.num_free(),
            waiting = self.waiting.len(),
            "scheduled batch"
        );
        BatchDescriptor {
            batch_id,
            tick: self.tick,
            sequences,
            overlap,
            preempted: draft.preempted,
            retried_handoffs,
        }
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    /// Apply the executor's results for a batch and unpin its blocks.
    pub fn complete(&mut self, output: BatchOutput) -> Result<()> {
        match self.complete_inner(output) {
            Err(e) if e.is_fatal() => Err(self.on_fatal(e)),
            other => other,
        }
    }

    fn complete_inner(&mut self, output: BatchOutput) -> Result<()> {
        let batch_id = output.batch_id;
        let entries = self.in_flight.remove(&batch_id).ok_or(SchedulerError::UnknownBatch(batch_id))?;
        self.blocks.release_batch(batch_id)?;

        let mut logits: HashMap<RequestId, Array2<f32>> =
            output.outputs.into_iter().map(|o| (o.request_id, o.logits)).collect();
        let now = self.clock.now_ms();
        let eos = self.eos_token();

        for entry in entries {
            let id = entry.request_id;
            let Some(seq) = self.seqs.get_mut(id) else { continue };
            if seq.in_flight != Some(batch_id) {
                continue;
            }
            seq.in_flight = None;
            if seq.is_finished() {
                continue;
            }
            if entry.kind == StepKind::Prefill {
                seq.num_computed = seq.num_computed.max(entry.start_pos + entry.num_tokens());
            }
            if !entry.samples {
                self.blocks.seal_full_blocks(id, seq.all_tokens(), seq.num_computed);
                continue;
            }

            let Some(rows) = logits.remove(&id).filter(|l| l.nrows() > 0) else {
                warn!(request_id = id, batch_id, "executor returned no logits");
                seq.fail(FinishReason::Error("executor returned no logits".into()));
                self.blocks.free(id)?;
                self.retire(id);
                continue;
            };
            let verification = match self.speculative.as_mut() {
                Some(spec) if !entry.speculative_tokens.is_empty() => {
                    spec.verify(&entry.speculative_tokens, rows.view(), seq.sampling(), &*self.policy)
                }
                _ => speculative::verify(&[], rows.view(), seq.sampling(), &*self.policy),
            };

            let prev_len = seq.len();
            let mut stop = None;
            for &token in &verification.tokens {
                seq.push_token(token);
                stop = seq.stop_reason(eos);
                if stop.is_some() {
                    break;
                }
            }
            if entry.kind == StepKind::Decode {
                seq.num_computed = (prev_len + verification.accepted).min(seq.len() - 1);
            }
            self.blocks.seal_full_blocks(id, seq.all_tokens(), seq.num_computed);

            if let Some(reason) = stop {
                info!(request_id = id, generated = seq.completion_token_count(), ?reason, "request finished");
                seq.finish(reason);
                self.blocks.free(id)?;
                self.retire(id);
                continue;
            }

            if entry.kind == StepKind::Prefill {
                match self.disagg.as_mut() {
                    Some(disagg) if seq.remote_prefill => {
                        let table = self.blocks.table(id).cloned().unwrap_or_default();
                        disagg.initiate_handoff(id, seq.num_computed, table, now);
                    }
                    _ => {
                        seq.set_phase(SequencePhase::Decoding);
                    }
                }
            }
        }
        Ok(())
    }

    /// Give up on a batch the executor could not run. Its requests fail.
    pub fn abort_batch(&mut self, batch_id: u64, reason: &str) -> Result<()> {
        let entries = self.in_flight.remove(&batch_id).ok_or(SchedulerError::UnknownBatch(batch_id))?;
        self.blocks.release_batch(batch_id)?;
        for entry in entries {
            let id = entry.request_id;
            let Some(seq) = self.seqs.get_mut(id) else { continue };
            if seq.in_flight != Some(batch_id) {
                continue;
            }
            seq.in_flight = None;
            seq.fail(FinishReason::Error(reason.to_string()));
            self.blocks.free(id)?;
            self.retire(id);
        }
        error!(batch_id, "batch aborted: {reason}");
        Ok(())
    }

    /// Move a terminal request out of the live set.
    fn retire(&mut self, id: RequestId) {
        self.pending_cancel.remove(&id);
        self.waiting.remove(id);
        if let Some(seq) = self.seqs.remove(id) {
            self.finished.push(seq.to_output());
        }
    }

    /// Fail every request holding blocks, since the allocator can no longer
    /// vouch for them, then rebuild the pool. Requests that held no blocks
    /// keep their place and the scheduler stays usable.
    fn on_fatal(&mut self, err: SchedulerError) -> SchedulerError {
        error!("allocator corruption: {err}");
        let mut affected: Vec<RequestId> = self
            .seqs
            .iter()
            .filter(|s| self.blocks.num_blocks_of(s.id()) > 0)
            .map(Sequence::id)
            .collect();
        affected.sort_unstable();
        for id in affected {
            if let Some(seq) = self.seqs.get_mut(id) {
                seq.in_flight = None;
                seq.fail(FinishReason::Error(err.to_string()));
            }
            if let Some(disagg) = self.disagg.as_mut() {
                disagg.cancel(id);
            }
            self.retire(id);
        }
        // every batch held blocks of a failed request; late outputs are UnknownBatch
        self.in_flight.clear();
        self.blocks.reset();
        err
    }
}
