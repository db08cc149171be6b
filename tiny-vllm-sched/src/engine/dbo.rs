//! Dual-batch overlap.
//!
//! A model-parallel step is split into two micro-batches so that one
//! micro-batch's cross-device communication runs while the other computes.
//! The split is a pure function of the per-sequence costs, in batch order:
//! same batch, same split.

use serde::Serialize;

use crate::config::DboConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MicroBatch {
    A = 0,
    B = 1,
}

impl MicroBatch {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageOp {
    Compute,
    Communicate,
}

/// What each micro-batch does during one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub a: StageOp,
    pub b: StageOp,
}

/// A computes while B communicates, then the roles swap.
pub const OVERLAP_STAGES: [Stage; 2] = [
    Stage { a: StageOp::Compute, b: StageOp::Communicate },
    Stage { a: StageOp::Communicate, b: StageOp::Compute },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlapPlan {
    /// Sequences `[0, split)` form micro-batch A, the rest micro-batch B.
    pub split: usize,
    pub tokens_a: usize,
    pub tokens_b: usize,
    /// Empty when the batch runs as one micro-batch.
    pub stages: Vec<Stage>,
}

impl OverlapPlan {
    fn single(costs: &[usize]) -> Self {
        Self { split: costs.len(), tokens_a: costs.iter().sum(), tokens_b: 0, stages: Vec::new() }
    }

    pub fn is_split(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn micro_batch_of(&self, position: usize) -> MicroBatch {
        if position < self.split { MicroBatch::A } else { MicroBatch::B }
    }
}

#[derive(Debug, Clone)]
pub struct DualBatchOverlap {
    config: DboConfig,
}

impl DualBatchOverlap {
    pub fn new(config: DboConfig) -> Self {
        Self { config }
    }

    /// Split a batch whose sequences cost `costs` tokens each.
    pub fn partition(&self, costs: &[usize]) -> OverlapPlan {
        let total: usize = costs.iter().sum();
        if !self.config.enabled || total < self.config.min_batch_tokens.max(2) {
            return OverlapPlan::single(costs);
        }
        match split_index(costs, self.config.imbalance_ratio) {
            Some(split) if split > 0 && split < costs.len() => {
                let tokens_a: usize = costs[..split].iter().sum();
                OverlapPlan { split, tokens_a, tokens_b: total - tokens_a, stages: OVERLAP_STAGES.to_vec() }
            }
            _ => OverlapPlan::single(costs),
        }
    }
}

/// First sequence boundary where the running cost reaches half the total,
/// or the boundary before it, whichever lies within `imbalance_ratio * total`
/// of the half. `None` if neither does.
fn split_index(costs: &[usize], imbalance_ratio: f64) -> Option<usize> {
    let total: usize = costs.iter().sum();
    let half = (total / 2) as f64;
    let tolerance = total as f64 * imbalance_ratio;
    let mut running = 0usize;
    for (i, &cost) in costs.iter().enumerate() {
        running += cost;
        if running >= total / 2 {
            if (running as f64 - half).abs() < tolerance {
                return Some(i + 1);
            }
            if ((running - cost) as f64 - half).abs() < tolerance {
                return Some(i);
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dbo() -> DualBatchOverlap {
        DualBatchOverlap::new(DboConfig::default())
    }

    #[test]
    fn test_decode_only_splits_in_half() {
        let plan = dbo().partition(&[1, 1, 1, 1]);
        assert_eq!(plan.split, 2);
        assert_eq!((plan.tokens_a, plan.tokens_b), (2, 2));
        assert_eq!(plan.stages, OVERLAP_STAGES.to_vec());
        assert_eq!(plan.micro_batch_of(1), MicroBatch::A);
        assert_eq!(plan.micro_batch_of(2), MicroBatch::B);
    }

    #[test]
    fn test_mixed_batch_split_respects_imbalance_ratio() {
        // running: 10, 60, 100; half 50, tolerance 10. Neither 60 nor 10 is
        // strictly within tolerance, so no split.
        assert!(!dbo().partition(&[10, 50, 40]).is_split());

        // running: 45, 60, 100; 60 misses, previous boundary 45 is 5 away.
        let plan = dbo().partition(&[45, 15, 40]);
        assert_eq!(plan.split, 1);
        assert_eq!((plan.tokens_a, plan.tokens_b), (45, 55));
    }

    #[test]
    fn test_single_sequence_or_disabled_is_not_split() {
        assert!(!dbo().partition(&[100]).is_split());
        assert!(!dbo().partition(&[]).is_split());

        let off = DualBatchOverlap::new(DboConfig { enabled: false, ..Default::default() });
        let plan = off.partition(&[1, 1, 1, 1]);
        assert!(!plan.is_split());
        assert_eq!(plan.split, 4);
        assert_eq!(plan.micro_batch_of(3), MicroBatch::A);

        let big_min = DualBatchOverlap::new(DboConfig { min_batch_tokens: 64, ..Default::default() });
        assert!(!big_min.partition(&[16, 16]).is_split());
    }

    proptest! {
        #[test]
        fn partition_is_deterministic(costs in proptest::collection::vec(1usize..200, 0..32)) {
            let d = dbo();
            let first = d.partition(&costs);
            prop_assert_eq!(&first, &d.partition(&costs));
            prop_assert_eq!(first.tokens_a + first.tokens_b, costs.iter().sum::<usize>());
            if first.is_split() {
                prop_assert!(first.split > 0 && first.split < costs.len());
            }
        }
    }
}
