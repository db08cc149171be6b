pub mod admission;
pub mod block_manager;
pub mod dbo;
pub mod disagg;
pub mod llm_engine;
pub mod preemption;
pub mod sampler;
pub mod scheduler;
pub mod sequence;
pub mod speculative;
