//! Per-request bookkeeping.
//!
//! Tracks phase, tokens, scheduling history and sampling parameters for every
//! live request. The [`SequenceTracker`] is the only owner of [`Sequence`]
//! values; everything else refers to requests by id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::sampling_params::SamplingParams;

pub type RequestId = u64;
pub type TokenId = i64;

/// Possible phases of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequencePhase {
    Waiting,
    Prefilling,
    Decoding,
    Preempted,
    Finished,
    Failed,
}

impl SequencePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SequencePhase::Finished | SequencePhase::Failed)
    }

    /// Edges of the request state machine.
    pub fn can_transition_to(self, next: SequencePhase) -> bool {
        use SequencePhase::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Waiting, Prefilling) => true,
            (Prefilling, Decoding | Finished | Waiting) => true,
            (Decoding, Decoding | Finished) => true,
            (Waiting | Prefilling | Decoding, Preempted) => true,
            (Preempted, Waiting) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
    Error(String),
}

/// A request as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub prompt: Vec<TokenId>,
    pub sampling: SamplingParams,
    /// Larger values are scheduled first.
    pub priority: i32,
}

impl Request {
    pub fn new(prompt: Vec<TokenId>, sampling: SamplingParams) -> Self {
        Self { prompt, sampling, priority: 0 }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    pub phase: SequencePhase,
    pub generated_tokens: usize,
}

/// Result from a finished or failed request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutput {
    pub request_id: RequestId,
    pub all_token_ids: Vec<TokenId>,
    pub completion_token_ids: Vec<TokenId>,
    pub prompt_token_count: usize,
    pub phase: SequencePhase,
    pub finish_reason: Option<FinishReason>,
}

/// Main structure for a single inference request.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub(crate) id: RequestId,
    phase: SequencePhase,
    token_ids: Vec<TokenId>,
    prompt_len: usize,
    pub(crate) num_computed: usize,
    pub(crate) sampling: SamplingParams,
    pub(crate) priority: i32,
    pub(crate) arrival_ms: u64,
    pub(crate) preemption_count: u32,
    pub(crate) last_scheduled_tick: Option<u64>,
    pub(crate) in_flight: Option<u64>,
    pub(crate) remote_prefill: bool,
    pub(crate) finish_reason: Option<FinishReason>,
}

impl Sequence {
    pub fn new(id: RequestId, request: Request, arrival_ms: u64) -> Self {
        Self {
            id,
            phase: SequencePhase::Waiting,
            prompt_len: request.prompt.len(),
            token_ids: request.prompt,
            num_computed: 0,
            sampling: request.sampling,
            priority: request.priority,
            arrival_ms,
            preemption_count: 0,
            last_scheduled_tick: None,
            in_flight: None,
            remote_prefill: false,
            finish_reason: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn phase(&self) -> SequencePhase {
        self.phase
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn arrival_ms(&self) -> u64 {
        self.arrival_ms
    }

    pub fn preemption_count(&self) -> u32 {
        self.preemption_count
    }

    pub fn num_computed(&self) -> usize {
        self.num_computed
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Total number of tokens, prompt included.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn all_tokens(&self) -> &[TokenId] {
        &self.token_ids
    }

    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.token_ids[..self.prompt_len]
    }

    pub fn completion_tokens(&self) -> &[TokenId] {
        &self.token_ids[self.prompt_len..]
    }

    pub fn completion_token_count(&self) -> usize {
        self.token_ids.len() - self.prompt_len
    }

    /// Tokens whose KV has not been written yet.
    pub fn num_uncomputed(&self) -> usize {
        self.len() - self.num_computed
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.token_ids.last().copied()
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn push_token(&mut self, token: TokenId) {
        self.token_ids.push(token);
    }

    /// Should generation stop (due to max tokens or EOS)?
    pub fn stop_reason(&self, eos_token: Option<TokenId>) -> Option<FinishReason> {
        match (
            self.completion_token_count() >= self.sampling.max_tokens,
            self.sampling.ignore_eos,
            eos_token,
        ) {
            (_, false, Some(eos)) if self.completion_token_count() > 0 && self.last_token() == Some(eos) => {
                Some(FinishReason::Stop)
            }
            (true, _, _) => Some(FinishReason::Length),
            _ => None,
        }
    }

    /// Move to `next`, returning whether the edge exists.
    pub(crate) fn set_phase(&mut self, next: SequencePhase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.phase = next;
        true
    }

    /// Drop all computed state; the request will prefill from scratch.
    pub(crate) fn preempt(&mut self) {
        if self.set_phase(SequencePhase::Preempted) {
            self.preemption_count += 1;
            self.num_computed = 0;
            self.remote_prefill = false;
            self.set_phase(SequencePhase::Waiting);
        }
    }

    pub(crate) fn finish(&mut self, reason: FinishReason) {
        if self.set_phase(SequencePhase::Finished) {
            self.finish_reason = Some(reason);
        }
    }

    pub(crate) fn fail(&mut self, reason: FinishReason) {
        if self.set_phase(SequencePhase::Failed) {
            self.finish_reason = Some(reason);
        }
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus { phase: self.phase, generated_tokens: self.completion_token_count() }
    }

    pub fn to_output(&self) -> RequestOutput {
        RequestOutput {
            request_id: self.id,
            all_token_ids: self.token_ids.clone(),
            completion_token_ids: self.completion_tokens().to_vec(),
            prompt_token_count: self.prompt_len,
            phase: self.phase,
            finish_reason: self.finish_reason.clone(),
        }
    }
}

/// Owner of every live [`Sequence`] in one scheduler instance.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next_id: RequestId,
    seqs: HashMap<RequestId, Sequence>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn create(&mut self, request: Request, arrival_ms: u64) -> RequestId {
        let id = self.next_id();
        self.seqs.insert(id, Sequence::new(id, request, arrival_ms));
        id
    }

    pub fn insert(&mut self, seq: Sequence) {
        self.seqs.insert(seq.id, seq);
    }

    pub fn get(&self, id: RequestId) -> Option<&Sequence> {
        self.seqs.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Sequence> {
        self.seqs.get_mut(&id)
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Sequence> {
        self.seqs.remove(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.seqs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.seqs.values()
    }

    /// Ids in `phase`, sorted for deterministic iteration.
    pub fn ids_in_phase(&self, phase: SequencePhase) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.seqs.values().filter(|s| s.phase == phase).map(|s| s.id).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(prompt: Vec<TokenId>, max_tokens: usize) -> Sequence {
        Sequence::new(0, Request::new(prompt, SamplingParams { max_tokens, ..Default::default() }), 5)
    }

    #[test]
    fn test_state_machine_edges() {
        use SequencePhase::*;
        assert!(Waiting.can_transition_to(Prefilling));
        assert!(Prefilling.can_transition_to(Waiting));
        assert!(Decoding.can_transition_to(Preempted));
        assert!(Preempted.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Failed));
        assert!(!Waiting.can_transition_to(Decoding));
        assert!(!Preempted.can_transition_to(Decoding));
        assert!(!Finished.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Waiting));
    }

    #[test]
    fn test_preempt_resets_progress_and_keeps_arrival() {
        let mut s = seq(vec![1, 2, 3], 8);
        assert!(s.set_phase(SequencePhase::Prefilling));
        s.num_computed = 3;
        s.push_token(9);
        assert!(s.set_phase(SequencePhase::Decoding));
        s.preempt();
        assert_eq!(s.phase(), SequencePhase::Waiting);
        assert_eq!(s.num_computed(), 0);
        assert_eq!(s.preemption_count(), 1);
        assert_eq!(s.arrival_ms(), 5);
        assert_eq!(s.completion_tokens(), &[9]);
    }

    #[test]
    fn test_stop_reasons() {
        let mut s = seq(vec![1, 2], 2);
        assert_eq!(s.stop_reason(Some(0)), None);
        s.push_token(4);
        assert_eq!(s.stop_reason(Some(0)), None);
        s.push_token(0);
        assert_eq!(s.stop_reason(Some(0)), Some(FinishReason::Stop));
        assert_eq!(s.stop_reason(None), Some(FinishReason::Length));

        let mut ignoring = seq(vec![1], 4);
        ignoring.sampling.ignore_eos = true;
        ignoring.push_token(0);
        assert_eq!(ignoring.stop_reason(Some(0)), None);
    }

    #[test]
    fn test_terminal_phases_are_sticky() {
        let mut s = seq(vec![1], 1);
        s.fail(FinishReason::Cancelled);
        assert_eq!(s.phase(), SequencePhase::Failed);
        s.finish(FinishReason::Stop);
        assert_eq!(s.finish_reason, Some(FinishReason::Cancelled));
        s.preempt();
        assert_eq!(s.phase(), SequencePhase::Failed);
    }

    #[test]
    fn test_tracker_mints_unique_ids() {
        let mut tracker = SequenceTracker::new();
        let a = tracker.create(Request::new(vec![1], SamplingParams::default()), 0);
        let b = tracker.create(Request::new(vec![2], SamplingParams::default()), 0);
        assert_ne!(a, b);
        assert_eq!(tracker.ids_in_phase(SequencePhase::Waiting), vec![a, b]);
        assert_eq!(tracker.remove(a).map(|s| s.id()), Some(a));
        assert!(!tracker.contains(a));
    }
}
