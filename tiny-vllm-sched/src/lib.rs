//! Request scheduling core for a paged-KV LLM inference server.
//!
//! [`Scheduler`] decides, tick by tick, which requests run, which KV blocks
//! they use and how the batch is split for overlap. [`LlmEngine`] drives it
//! against a model executor.

pub mod config;
pub mod engine;
pub mod error;
pub mod sampling_params;
pub mod utils;

pub use config::{DboConfig, DisaggConfig, PreemptionConfig, SchedulerConfig, SpeculativeConfig};
pub use engine::disagg::{KvTransport, LoopbackTransport};
pub use engine::llm_engine::{CompletionSender, Executor, LlmEngine, StepOutcome};
pub use engine::sampler::{GreedyPolicy, SamplingPolicy};
pub use engine::scheduler::{
    BatchDescriptor, BatchOutput, ScheduledSequence, Scheduler, SchedulerBuilder, SequenceOutput, StepKind,
};
pub use engine::sequence::{FinishReason, Request, RequestId, RequestOutput, RequestStatus, SequencePhase, TokenId};
pub use error::SchedulerError;
pub use sampling_params::SamplingParams;
pub use utils::clock::{Clock, ManualClock, MonotonicClock};
