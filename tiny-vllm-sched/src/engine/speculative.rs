//! Prompt-lookup speculative decoding.
//!
//! Candidates come from the sequence's own history: the longest recent suffix
//! n-gram that occurred earlier is looked up and the tokens that followed it
//! are proposed. Verification accepts the longest prefix of candidates that
//! agrees with the target model's own choices and then appends the target's
//! token at the first disagreement (or after the last candidate).

use ndarray::ArrayView2;

use crate::config::SpeculativeConfig;
use crate::engine::sampler::SamplingPolicy;
use crate::engine::sequence::TokenId;
use crate::sampling_params::SamplingParams;

#[derive(Debug, Clone, Copy)]
pub struct NgramProposer {
    min_n: usize,
    max_n: usize,
    lookahead: usize,
}

impl NgramProposer {
    pub fn new(min_n: usize, max_n: usize, lookahead: usize) -> Self {
        Self { min_n: min_n.max(1), max_n: max_n.max(min_n.max(1)), lookahead }
    }

    /// Candidate continuation of `tokens`, at most `lookahead` long. Yields
    /// nothing when no suffix n-gram repeats.
    pub fn propose<'a>(&self, tokens: &'a [TokenId]) -> impl Iterator<Item = TokenId> + 'a {
        let found = self.find_continuation(tokens);
        let lookahead = self.lookahead;
        found
            .map(|start| &tokens[start..(start + lookahead).min(tokens.len())])
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    fn find_continuation(&self, tokens: &[TokenId]) -> Option<usize> {
        if self.lookahead == 0 || tokens.len() < 2 {
            return None;
        }
        let history = &tokens[..tokens.len() - 1];
        (self.min_n..=self.max_n).rev().find_map(|n| {
            if n >= tokens.len() {
                return None;
            }
            let suffix = &tokens[tokens.len() - n..];
            history.windows(n).rposition(|w| w == suffix).map(|pos| pos + n)
        })
    }
}

/// Outcome of checking one sequence's candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub accepted: usize,
    /// Tokens to append: the accepted candidates plus the target's own token.
    pub tokens: Vec<TokenId>,
}

/// Check `candidates` against target logits. Row `i` of `logits` is the
/// distribution for the position right after candidate `i - 1` (row 0 follows
/// the last committed token).
pub fn verify<P: SamplingPolicy + ?Sized>(
    candidates: &[TokenId],
    logits: ArrayView2<'_, f32>,
    params: &SamplingParams,
    policy: &P,
) -> Verification {
    let mut tokens = Vec::with_capacity(candidates.len() + 1);
    let mut accepted = 0;
    for (i, row) in logits.rows().into_iter().enumerate() {
        let actual = policy.sample(row, params);
        tokens.push(actual);
        match candidates.get(i) {
            Some(&c) if c == actual => accepted += 1,
            _ => break,
        }
    }
    Verification { accepted, tokens }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecDecodeStats {
    pub steps: u64,
    pub proposed_tokens: u64,
    pub accepted_tokens: u64,
}

impl SpecDecodeStats {
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed_tokens == 0 { 0.0 } else { self.accepted_tokens as f64 / self.proposed_tokens as f64 }
    }
}

#[derive(Debug, Clone)]
pub struct SpeculativeCoordinator {
    proposer: NgramProposer,
    disable_by_batch_size: Option<usize>,
    stats: SpecDecodeStats,
}

impl SpeculativeCoordinator {
    pub fn new(config: &SpeculativeConfig) -> Self {
        Self {
            proposer: NgramProposer::new(
                config.prompt_lookup_min,
                config.prompt_lookup_max,
                config.num_speculative_tokens,
            ),
            disable_by_batch_size: config.disable_by_batch_size,
            stats: SpecDecodeStats::default(),
        }
    }

    pub fn lookahead(&self) -> usize {
        self.proposer.lookahead
    }

    /// Speculation is switched off for a tick once this many requests decode.
    pub fn should_speculate(&self, num_decoding: usize) -> bool {
        self.disable_by_batch_size.map_or(true, |limit| num_decoding < limit)
    }

    pub fn propose<'a>(&self, tokens: &'a [TokenId]) -> impl Iterator<Item = TokenId> + 'a {
        self.proposer.propose(tokens)
    }

    pub fn verify<P: SamplingPolicy + ?Sized>(
        &mut self,
        candidates: &[TokenId],
        logits: ArrayView2<'_, f32>,
        params: &SamplingParams,
        policy: &P,
    ) -> Verification {
        let outcome = verify(candidates, logits, params, policy);
        if !candidates.is_empty() {
            self.stats.steps += 1;
            self.stats.proposed_tokens += candidates.len() as u64;
            self.stats.accepted_tokens += outcome.accepted as u64;
        }
        outcome
    }

    pub fn stats(&self) -> SpecDecodeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sampler::GreedyPolicy;
    use ndarray::Array2;
    use proptest::prelude::*;

    /// Logits whose argmax in row `i` is `picks[i]`.
    fn one_hot(picks: &[TokenId], vocab: usize) -> Array2<f32> {
        let mut logits = Array2::zeros((picks.len(), vocab));
        for (row, &t) in picks.iter().enumerate() {
            logits[[row, t as usize]] = 1.0;
        }
        logits
    }

    #[test]
    fn test_propose_follows_repeated_ngram() {
        let p = NgramProposer::new(1, 3, 3);
        let got: Vec<_> = p.propose(&[1, 2, 3, 4, 5, 1, 2, 3]).collect();
        assert_eq!(got, vec![4, 5, 1]);
    }

    #[test]
    fn test_propose_prefers_most_recent_occurrence() {
        let p = NgramProposer::new(1, 1, 2);
        let got: Vec<_> = p.propose(&[7, 1, 7, 2, 9, 7]).collect();
        assert_eq!(got, vec![2, 9]);
    }

    #[test]
    fn test_propose_empty_without_match() {
        let p = NgramProposer::new(2, 2, 4);
        assert_eq!(p.propose(&[1, 2, 3, 4, 5]).count(), 0);
        assert_eq!(p.propose(&[]).count(), 0);
        assert_eq!(NgramProposer::new(1, 2, 0).propose(&[1, 1, 1]).count(), 0);
    }

    #[test]
    fn test_propose_is_capped_by_lookahead_and_history() {
        let p = NgramProposer::new(1, 2, 8);
        let got: Vec<_> = p.propose(&[5, 6, 5]).collect();
        assert_eq!(got, vec![6, 5]);
    }

    #[test]
    fn test_verify_stops_at_first_mismatch() {
        let out = verify(&[4, 5, 6], one_hot(&[4, 9, 6, 1], 10).view(), &SamplingParams::default(), &GreedyPolicy);
        assert_eq!(out, Verification { accepted: 1, tokens: vec![4, 9] });
    }

    #[test]
    fn test_verify_all_accepted_adds_bonus_token() {
        let out = verify(&[4, 5], one_hot(&[4, 5, 8], 10).view(), &SamplingParams::default(), &GreedyPolicy);
        assert_eq!(out, Verification { accepted: 2, tokens: vec![4, 5, 8] });
    }

    #[test]
    fn test_verify_without_candidates_is_plain_decode() {
        let out = verify(&[], one_hot(&[3], 10).view(), &SamplingParams::default(), &GreedyPolicy);
        assert_eq!(out, Verification { accepted: 0, tokens: vec![3] });
    }

    #[test]
    fn test_coordinator_disable_and_stats() {
        let cfg = SpeculativeConfig { disable_by_batch_size: Some(3), ..Default::default() };
        let mut coord = SpeculativeCoordinator::new(&cfg);
        assert!(coord.should_speculate(2));
        assert!(!coord.should_speculate(3));

        coord.verify(&[1, 2], one_hot(&[1, 0, 0], 4).view(), &SamplingParams::default(), &GreedyPolicy);
        let stats = coord.stats();
        assert_eq!((stats.steps, stats.proposed_tokens, stats.accepted_tokens), (1, 2, 1));
        assert!((stats.acceptance_rate() - 0.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn accepted_never_exceeds_proposed(
            candidates in proptest::collection::vec(0i64..6, 0..6),
            picks in proptest::collection::vec(0i64..6, 1..8),
        ) {
            let out = verify(&candidates, one_hot(&picks, 6).view(), &SamplingParams::default(), &GreedyPolicy);
            prop_assert!(out.accepted <= candidates.len());
            prop_assert_eq!(&out.tokens[..out.accepted], &candidates[..out.accepted]);
            prop_assert_eq!(&out.tokens[..], &picks[..out.tokens.len()]);
            if out.accepted < candidates.len() && out.accepted < picks.len() {
                prop_assert_ne!(out.tokens[out.accepted], candidates[out.accepted]);
            }
        }
    }
}
