use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default scheduler settings.
pub mod settings {
    /// Max tokens that can be batched together in a single forward pass.
    pub const MAX_NUM_BATCHED_TOKENS: usize = 8192;
    /// Maximum number of sequences processed concurrently.
    pub const MAX_NUM_SEQS: usize = 256;
    /// Maximum model sequence length (prompt plus completion).
    pub const MAX_MODEL_LEN: usize = 4096;
    /// KV cache block size in tokens.
    pub const KVCACHE_BLOCK_SIZE: usize = 16;
    /// Number of KV cache blocks in the pool.
    pub const NUM_KVCACHE_BLOCKS: usize = 1024;
    /// Whether long prompts may be prefilled across several ticks.
    pub const ENABLE_CHUNKED_PREFILL: bool = true;
    /// Default end-of-sequence token id.
    pub const EOS: i64 = -1;
    /// Speculative lookahead.
    pub const NUM_SPECULATIVE_TOKENS: usize = 4;
    /// Shortest n-gram used for prompt lookup.
    pub const PROMPT_LOOKUP_MIN: usize = 1;
    /// Longest n-gram used for prompt lookup.
    pub const PROMPT_LOOKUP_MAX: usize = 4;
    /// Deadline for a KV handoff before it is treated as failed.
    pub const TRANSFER_TIMEOUT_MS: u64 = 30_000;
    /// Uncached prompt length above which prefill runs on a remote worker.
    pub const MAX_LOCAL_PREFILL_LEN: usize = 512;
    /// Tolerated distance from an even dual-batch split, as a fraction of the total.
    pub const DBO_IMBALANCE_RATIO: f64 = 0.1;
    /// Batches below this many tokens run as a single micro-batch.
    pub const DBO_MIN_BATCH_TOKENS: usize = 2;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_num_batched_tokens: usize,
    pub max_num_seqs: usize,
    pub max_model_len: usize,
    pub enable_chunked_prefill: bool,
    pub eos: i64,
    pub kvcache_block_size: usize,
    pub num_kvcache_blocks: usize,
    pub preemption: PreemptionConfig,
    pub speculative: Option<SpeculativeConfig>,
    pub disagg: Option<DisaggConfig>,
    pub dbo: DboConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: settings::MAX_NUM_BATCHED_TOKENS,
            max_num_seqs: settings::MAX_NUM_SEQS,
            max_model_len: settings::MAX_MODEL_LEN,
            enable_chunked_prefill: settings::ENABLE_CHUNKED_PREFILL,
            eos: settings::EOS,
            kvcache_block_size: settings::KVCACHE_BLOCK_SIZE,
            num_kvcache_blocks: settings::NUM_KVCACHE_BLOCKS,
            preemption: PreemptionConfig::default(),
            speculative: None,
            disagg: None,
            dbo: DboConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json).context("parsing scheduler config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scheduler config {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_kvcache_blocks == 0 || self.kvcache_block_size == 0 {
            bail!("KV cache pool and block size must be non-zero");
        }
        if self.max_num_seqs == 0 || self.max_num_batched_tokens == 0 {
            bail!("batch limits must be non-zero");
        }
        if !self.enable_chunked_prefill && self.max_num_batched_tokens < self.max_model_len {
            bail!(
                "max_num_batched_tokens ({}) must cover max_model_len ({}) without chunked prefill",
                self.max_num_batched_tokens,
                self.max_model_len
            );
        }
        if let Some(spec) = &self.speculative {
            if spec.prompt_lookup_min == 0 || spec.prompt_lookup_min > spec.prompt_lookup_max {
                bail!(
                    "invalid n-gram window [{}, {}]",
                    spec.prompt_lookup_min,
                    spec.prompt_lookup_max
                );
            }
        }
        if !(0.0..=1.0).contains(&self.dbo.imbalance_ratio) {
            bail!("dbo.imbalance_ratio must be within [0, 1]");
        }
        Ok(())
    }

    pub fn with_blocks(mut self, num_blocks: usize, block_size: usize) -> Self {
        self.num_kvcache_blocks = num_blocks;
        self.kvcache_block_size = block_size;
        self
    }

    pub fn with_speculative(mut self, spec: SpeculativeConfig) -> Self {
        self.speculative = Some(spec);
        self
    }

    pub fn with_disagg(mut self, disagg: DisaggConfig) -> Self {
        self.disagg = Some(disagg);
        self
    }
}

/// Victim selection policy points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreemptionConfig {
    pub prefer_decode_victims: bool,
    pub allow_admission_preemption: bool,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self { prefer_decode_victims: true, allow_admission_preemption: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpeculativeConfig {
    pub num_speculative_tokens: usize,
    pub prompt_lookup_min: usize,
    pub prompt_lookup_max: usize,
    pub disable_by_batch_size: Option<usize>,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: settings::NUM_SPECULATIVE_TOKENS,
            prompt_lookup_min: settings::PROMPT_LOOKUP_MIN,
            prompt_lookup_max: settings::PROMPT_LOOKUP_MAX,
            disable_by_batch_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisaggConfig {
    pub transfer_timeout_ms: u64,
    pub max_local_prefill_len: usize,
}

impl Default for DisaggConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: settings::TRANSFER_TIMEOUT_MS,
            max_local_prefill_len: settings::MAX_LOCAL_PREFILL_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DboConfig {
    pub enabled: bool,
    pub imbalance_ratio: f64,
    pub min_batch_tokens: usize,
}

impl Default for DboConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            imbalance_ratio: settings::DBO_IMBALANCE_RATIO,
            min_batch_tokens: settings::DBO_MIN_BATCH_TOKENS,
        }
    }
}
