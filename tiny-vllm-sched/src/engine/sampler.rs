//! Token selection from logits.
//!
//! The scheduler never samples for ordinary decode; the executor does. It only
//! needs a policy when checking speculative proposals against the real
//! distribution.

use ndarray::ArrayView1;

use crate::engine::sequence::TokenId;
use crate::sampling_params::SamplingParams;

/// Pure mapping from one row of logits to a token id.
pub trait SamplingPolicy {
    fn sample(&self, logits: ArrayView1<'_, f32>, params: &SamplingParams) -> TokenId;
}

impl<F> SamplingPolicy for F
where
    F: Fn(ArrayView1<'_, f32>, &SamplingParams) -> TokenId,
{
    fn sample(&self, logits: ArrayView1<'_, f32>, params: &SamplingParams) -> TokenId {
        self(logits, params)
    }
}

/// Argmax; ties go to the lowest token id.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyPolicy;

impl SamplingPolicy for GreedyPolicy {
    fn sample(&self, logits: ArrayView1<'_, f32>, _params: &SamplingParams) -> TokenId {
        let mut best = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for (idx, &v) in logits.iter().enumerate() {
            if v > best_val {
                best = idx;
                best_val = v;
            }
        }
        best as TokenId
    }
}
