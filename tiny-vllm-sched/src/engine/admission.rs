//! Waiting-request queue.
//!
//! Requests are grouped by priority class; within a class they are served in
//! arrival order. A request re-entering the queue after preemption keeps its
//! original arrival stamp, so it goes back to where it was.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::engine::sequence::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: RequestId,
    pub priority: i32,
    pub arrival_ms: u64,
    /// Blocks needed before the request can start prefill.
    pub min_blocks: usize,
    /// Prompt tokens still to be computed.
    pub num_tokens: usize,
}

/// Limits for one batch.
#[derive(Debug, Clone, Copy)]
pub struct CapacityBudget {
    pub max_seqs: usize,
    pub max_tokens: usize,
    pub free_blocks: usize,
    /// Whether a prompt may be split to fit the remaining token budget.
    pub chunked_prefill: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionPlan {
    /// Candidates that fit, in scheduling order.
    pub admitted: Vec<RequestId>,
    /// Candidates passed over for lack of blocks; they keep their place.
    pub skipped: Vec<RequestId>,
}

type ClassKey = Reverse<i32>;
type EntryKey = (u64, RequestId);

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    classes: BTreeMap<ClassKey, BTreeMap<EntryKey, QueueEntry>>,
    index: HashMap<RequestId, (ClassKey, EntryKey)>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.remove(entry.id);
        let class = Reverse(entry.priority);
        let key = (entry.arrival_ms, entry.id);
        self.classes.entry(class).or_default().insert(key, entry);
        self.index.insert(entry.id, (class, key));
    }

    /// Put a preempted or failed-handoff request back. Its arrival stamp is
    /// unchanged, so it lands at its original FCFS position.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.push(entry);
    }

    pub fn remove(&mut self, id: RequestId) -> Option<QueueEntry> {
        let (class, key) = self.index.remove(&id)?;
        let bucket = self.classes.get_mut(&class)?;
        let entry = bucket.remove(&key);
        if bucket.is_empty() {
            self.classes.remove(&class);
        }
        entry
    }

    pub fn get(&self, id: RequestId) -> Option<&QueueEntry> {
        let (class, key) = self.index.get(&id)?;
        self.classes.get(class)?.get(key)
    }

    /// Entries in service order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.classes.values().flat_map(|bucket| bucket.values())
    }

    /// Pick the requests that join the next batch.
    ///
    /// Higher classes drain first. A candidate whose block requirement exceeds
    /// what is left is skipped but stays queued; once a class has a skipped
    /// candidate, lower classes are not considered this tick.
    pub fn next_batch(&self, budget: CapacityBudget) -> AdmissionPlan {
        let mut plan = AdmissionPlan::default();
        let mut tokens_left = budget.max_tokens;
        let mut blocks_left = budget.free_blocks;

        'classes: for bucket in self.classes.values() {
            for entry in bucket.values() {
                if plan.admitted.len() >= budget.max_seqs || tokens_left == 0 {
                    break 'classes;
                }
                let cost = if budget.chunked_prefill {
                    entry.num_tokens.min(tokens_left)
                } else if entry.num_tokens <= tokens_left {
                    entry.num_tokens
                } else {
                    break 'classes;
                };
                if entry.min_blocks > blocks_left {
                    plan.skipped.push(entry.id);
                    continue;
                }
                blocks_left -= entry.min_blocks;
                tokens_left -= cost;
                plan.admitted.push(entry.id);
            }
            if !plan.skipped.is_empty() {
                break;
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: RequestId, priority: i32, arrival_ms: u64, min_blocks: usize) -> QueueEntry {
        QueueEntry { id, priority, arrival_ms, min_blocks, num_tokens: min_blocks * 16 }
    }

    fn budget(free_blocks: usize) -> CapacityBudget {
        CapacityBudget { max_seqs: 8, max_tokens: 4096, free_blocks, chunked_prefill: true }
    }

    #[test]
    fn test_fcfs_within_class_and_priority_across() {
        let mut q = AdmissionQueue::new();
        q.push(entry(1, 0, 30, 1));
        q.push(entry(2, 0, 10, 1));
        q.push(entry(3, 5, 50, 1));
        q.push(entry(4, 0, 20, 1));
        assert_eq!(q.next_batch(budget(100)).admitted, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_skipped_candidate_keeps_head_position() {
        let mut q = AdmissionQueue::new();
        q.push(entry(1, 0, 0, 50));
        q.push(entry(2, 0, 1, 5));
        let plan = q.next_batch(budget(20));
        assert_eq!(plan.admitted, vec![2]);
        assert_eq!(plan.skipped, vec![1]);
        assert_eq!(q.iter().next().map(|e| e.id), Some(1));
    }

    #[test]
    fn test_skipped_high_class_blocks_lower_classes() {
        let mut q = AdmissionQueue::new();
        q.push(entry(1, 9, 0, 50));
        q.push(entry(2, 0, 0, 1));
        let plan = q.next_batch(budget(20));
        assert!(plan.admitted.is_empty());
        assert_eq!(plan.skipped, vec![1]);
    }

    #[test]
    fn test_stops_at_batch_size_and_token_budget() {
        let mut q = AdmissionQueue::new();
        for id in 0..5 {
            q.push(entry(id, 0, id, 1));
        }
        let plan = q.next_batch(CapacityBudget { max_seqs: 3, ..budget(100) });
        assert_eq!(plan.admitted, vec![0, 1, 2]);

        let plan = q.next_batch(CapacityBudget { max_tokens: 40, chunked_prefill: false, ..budget(100) });
        assert_eq!(plan.admitted, vec![0, 1]);

        let plan = q.next_batch(CapacityBudget { max_tokens: 40, ..budget(100) });
        assert_eq!(plan.admitted, vec![0, 1, 2]);
    }

    #[test]
    fn test_requeue_restores_original_position() {
        let mut q = AdmissionQueue::new();
        q.push(entry(1, 0, 10, 1));
        q.push(entry(2, 0, 20, 1));
        let removed = q.remove(1).unwrap();
        q.push(entry(3, 0, 30, 1));
        q.requeue(removed);
        let order: Vec<_> = q.iter().map(|e| e.id).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(q.get(1).map(|e| e.arrival_ms), Some(10));
        assert_eq!(q.len(), 3);
    }
}
