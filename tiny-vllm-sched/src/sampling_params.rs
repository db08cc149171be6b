//! Sampling parameters carried by each request.
//!
//! The scheduler only reads `max_tokens` and `ignore_eos` directly; the rest is
//! handed to the [`SamplingPolicy`](crate::engine::sampler::SamplingPolicy)
//! when speculative tokens are verified.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub max_tokens: usize,
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            max_tokens: 16,
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    pub fn greedy(max_tokens: usize) -> Self {
        Self { temperature: 0.0, max_tokens, ..Default::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SchedulerError::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        if self.max_tokens == 0 {
            return Err(SchedulerError::InvalidRequest("max_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams::greedy(4).validate().is_ok());
    }

    #[test]
    fn rejects_malformed() {
        let bad = [
            SamplingParams { temperature: -0.5, ..Default::default() },
            SamplingParams { temperature: f32::NAN, ..Default::default() },
            SamplingParams { top_p: 0.0, ..Default::default() },
            SamplingParams { top_p: 1.2, ..Default::default() },
            SamplingParams { repetition_penalty: 0.0, ..Default::default() },
            SamplingParams { max_tokens: 0, ..Default::default() },
        ];
        for params in bad {
            assert!(matches!(params.validate(), Err(SchedulerError::InvalidRequest(_))), "{params:?}");
        }
    }
}
