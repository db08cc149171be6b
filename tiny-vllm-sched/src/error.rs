//! Error taxonomy for the scheduler core.

use thiserror::Error;

use crate::engine::block_manager::BlockId;
use crate::engine::sequence::RequestId;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("out of KV cache blocks: requested {requested}, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    #[error("KV transfer for request {request_id} failed: {reason}")]
    TransferFailed { request_id: RequestId, reason: String },

    #[error("KV transfer for request {request_id} timed out after {waited_ms}ms")]
    TransferTimeout { request_id: RequestId, waited_ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("allocator corruption on block {block_id}: {detail}")]
    AllocatorCorruption { block_id: BlockId, detail: String },

    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    #[error("unknown batch {0}")]
    UnknownBatch(u64),
}

impl SchedulerError {
    /// Fatal errors mean a broken invariant that cannot be repaired locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::AllocatorCorruption { .. })
    }

    /// Errors handled inside the scheduler by preemption or re-prefill.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SchedulerError::OutOfMemory { .. }
                | SchedulerError::TransferFailed { .. }
                | SchedulerError::TransferTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_out_of_memory() {
        let e = SchedulerError::OutOfMemory { requested: 10, available: 3 };
        assert_eq!(e.to_string(), "out of KV cache blocks: requested 10, available 3");
    }

    #[test]
    fn only_corruption_is_fatal() {
        let corrupt = SchedulerError::AllocatorCorruption { block_id: 7, detail: "underflow".into() };
        assert!(corrupt.is_fatal());
        assert!(!corrupt.is_recoverable());

        let timeout = SchedulerError::TransferTimeout { request_id: 1, waited_ms: 50 };
        assert!(!timeout.is_fatal());
        assert!(timeout.is_recoverable());

        assert!(!SchedulerError::InvalidRequest("empty prompt".into()).is_recoverable());
    }
}
