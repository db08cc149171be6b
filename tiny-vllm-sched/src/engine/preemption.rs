//! Victim selection under memory pressure.
//!
//! Ordering: decoding requests before prefilling ones (when configured), then
//! lowest priority, then fewest prior preemptions, then most recently
//! scheduled. Only blocks that would actually return to the free list count
//! towards the deficit.

use std::cmp::Reverse;

use crate::config::PreemptionConfig;
use crate::engine::sequence::{RequestId, SequencePhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictimCandidate {
    pub id: RequestId,
    pub phase: SequencePhase,
    pub priority: i32,
    pub preemption_count: u32,
    pub last_scheduled_tick: Option<u64>,
    pub arrival_ms: u64,
    pub reclaimable_blocks: usize,
}

#[derive(Debug, Clone)]
pub struct PreemptionManager {
    config: PreemptionConfig,
}

impl PreemptionManager {
    pub fn new(config: PreemptionConfig) -> Self {
        Self { config }
    }

    pub fn allows_admission_preemption(&self) -> bool {
        self.config.allow_admission_preemption
    }

    fn phase_rank(&self, phase: SequencePhase) -> u8 {
        match phase {
            SequencePhase::Decoding if self.config.prefer_decode_victims => 0,
            _ => 1,
        }
    }

    /// Victims, in preemption order, whose blocks cover `deficit_blocks`.
    /// Empty when even preempting every candidate would not be enough.
    pub fn select_victims(&self, deficit_blocks: usize, candidates: &[VictimCandidate]) -> Vec<RequestId> {
        if deficit_blocks == 0 {
            return Vec::new();
        }
        let mut ordered: Vec<&VictimCandidate> =
            candidates.iter().filter(|c| c.reclaimable_blocks > 0).collect();
        ordered.sort_by_key(|c| {
            (
                self.phase_rank(c.phase),
                c.priority,
                c.preemption_count,
                Reverse(c.last_scheduled_tick),
                Reverse(c.arrival_ms),
                Reverse(c.id),
            )
        });

        let mut victims = Vec::new();
        let mut reclaimed = 0;
        for c in ordered {
            victims.push(c.id);
            reclaimed += c.reclaimable_blocks;
            if reclaimed >= deficit_blocks {
                return victims;
            }
        }
        Vec::new()
    }

    /// Whether a running request that cannot grow may take `victim`'s blocks.
    /// Only requests served after it qualify: lower priority, or the same
    /// priority and a later arrival.
    pub fn may_reclaim_from(&self, requester: &VictimCandidate, victim: &VictimCandidate) -> bool {
        (Reverse(requester.priority), requester.arrival_ms, requester.id)
            < (Reverse(victim.priority), victim.arrival_ms, victim.id)
    }

    /// Whether a waiting request may displace `victim` to get admitted.
    ///
    /// Higher priority always wins. Within a class a victim that has been
    /// preempted fewer times than the requester may be displaced, as may any
    /// victim while neither side has been preempted yet. This bounds how often
    /// two requests can evict each other.
    pub fn may_displace(&self, requester: &VictimCandidate, victim: &VictimCandidate) -> bool {
        if victim.priority != requester.priority {
            return victim.priority < requester.priority;
        }
        victim.preemption_count < requester.preemption_count
            || (victim.preemption_count == 0 && requester.preemption_count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: RequestId, phase: SequencePhase, priority: i32, tick: u64, blocks: usize) -> VictimCandidate {
        VictimCandidate {
            id,
            phase,
            priority,
            preemption_count: 0,
            last_scheduled_tick: Some(tick),
            arrival_ms: id,
            reclaimable_blocks: blocks,
        }
    }

    #[test]
    fn test_decode_before_prefill() {
        let pm = PreemptionManager::new(PreemptionConfig::default());
        let cands = [
            cand(1, SequencePhase::Prefilling, 0, 9, 4),
            cand(2, SequencePhase::Decoding, 0, 1, 4),
        ];
        assert_eq!(pm.select_victims(4, &cands), vec![2]);
        assert_eq!(pm.select_victims(6, &cands), vec![2, 1]);

        let flat = PreemptionManager::new(PreemptionConfig { prefer_decode_victims: false, ..Default::default() });
        assert_eq!(flat.select_victims(4, &cands), vec![1]);
    }

    #[test]
    fn test_lowest_priority_then_most_recent() {
        let pm = PreemptionManager::new(PreemptionConfig::default());
        let cands = [
            cand(1, SequencePhase::Decoding, 1, 5, 2),
            cand(2, SequencePhase::Decoding, 0, 3, 2),
            cand(3, SequencePhase::Decoding, 0, 7, 2),
        ];
        assert_eq!(pm.select_victims(6, &cands), vec![3, 2, 1]);
    }

    #[test]
    fn test_growth_only_reclaims_from_lower_ranked() {
        let pm = PreemptionManager::new(PreemptionConfig::default());
        let high = cand(1, SequencePhase::Decoding, 5, 1, 2);
        let low = cand(2, SequencePhase::Decoding, 0, 1, 2);
        let low_later = cand(3, SequencePhase::Decoding, 0, 1, 2);
        assert!(pm.may_reclaim_from(&high, &low));
        assert!(!pm.may_reclaim_from(&low, &high));
        assert!(pm.may_reclaim_from(&low, &low_later));
        assert!(!pm.may_reclaim_from(&low_later, &low));
        assert!(!pm.may_reclaim_from(&low, &low));
    }

    #[test]
    fn test_preemption_count_protects_repeat_victims() {
        let pm = PreemptionManager::new(PreemptionConfig::default());
        let mut veteran = cand(1, SequencePhase::Decoding, 0, 9, 3);
        veteran.preemption_count = 2;
        let fresh = cand(2, SequencePhase::Decoding, 0, 1, 3);
        assert_eq!(pm.select_victims(3, &[veteran, fresh]), vec![2]);
    }

    #[test]
    fn test_insufficient_or_unreclaimable() {
        let pm = PreemptionManager::new(PreemptionConfig::default());
        let cands = [cand(1, SequencePhase::Decoding, 0, 1, 2), cand(2, SequencePhase::Decoding, 0, 1, 0)];
        assert!(pm.select_victims(5, &cands).is_empty());
        assert!(pm.select_victims(0, &cands).is_empty());
    }

    #[test]
    fn test_may_displace() {
        let pm = PreemptionManager::new(PreemptionConfig::default());
        let mut requester = cand(1, SequencePhase::Waiting, 0, 0, 0);
        let mut victim = cand(2, SequencePhase::Decoding, 0, 0, 4);
        assert!(pm.may_displace(&requester, &victim));

        victim.preemption_count = 1;
        assert!(!pm.may_displace(&requester, &victim));
        requester.preemption_count = 1;
        assert!(!pm.may_displace(&requester, &victim));
        requester.preemption_count = 2;
        assert!(pm.may_displace(&requester, &victim));

        victim.priority = 3;
        assert!(!pm.may_displace(&requester, &victim));
        requester.priority = 4;
        assert!(pm.may_displace(&requester, &victim));
    }
}
