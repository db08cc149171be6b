//! Disaggregated prefill handoff.
//!
//! When a request's prefill finishes on the prefill side, its KV blocks are
//! handed to the decode side through a [`KvTransport`]. The coordinator never
//! moves bytes itself: it opens a [`TransferHandle`], polls it without
//! blocking, and resolves it to either the block table for the decode side or
//! a failure. A handle that is still pending never yields blocks, and a handle
//! past its deadline fails deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use serde::Serialize;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::config::DisaggConfig;
use crate::engine::block_manager::{BlockId, BlockTable};
use crate::engine::sequence::RequestId;
use crate::error::SchedulerError;

pub type TransferId = u64;

/// What travels across the transport: a reference to block-serialized KV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvPayload {
    pub request_id: RequestId,
    pub num_tokens: usize,
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransferHandle {
    pub id: TransferId,
    pub request_id: RequestId,
    pub num_tokens: usize,
    pub started_ms: u64,
    pub deadline_ms: u64,
    state: TransferState,
    table: BlockTable,
    failure: Option<String>,
}

impl TransferHandle {
    pub fn state(&self) -> TransferState {
        self.state
    }
}

/// Resolution of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffStatus {
    Pending,
    Complete(BlockTable),
    Failed(SchedulerError),
}

/// Transport collaborator. Implementations must not block in `receive_kv`.
pub trait KvTransport {
    fn send_kv(&mut self, handle: &TransferHandle, payload: KvPayload) -> anyhow::Result<()>;

    /// `Ok(None)` while the payload has not arrived.
    fn receive_kv(&mut self, handle: &TransferHandle) -> anyhow::Result<Option<KvPayload>>;

    fn abort(&mut self, _handle: &TransferHandle) {}
}

pub struct DisaggCoordinator {
    config: DisaggConfig,
    transport: Box<dyn KvTransport + Send>,
    handles: HashMap<RequestId, TransferHandle>,
    next_id: TransferId,
}

impl std::fmt::Debug for DisaggCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisaggCoordinator")
            .field("config", &self.config)
            .field("pending", &self.handles.len())
            .finish()
    }
}

impl DisaggCoordinator {
    pub fn new(config: DisaggConfig, transport: Box<dyn KvTransport + Send>) -> Self {
        Self { config, transport, handles: HashMap::new(), next_id: 0 }
    }

    /// Prefill remotely when the uncached part of the prompt is long.
    pub fn should_prefill_remote(&self, prompt_len: usize, cached_tokens: usize) -> bool {
        prompt_len.saturating_sub(cached_tokens) > self.config.max_local_prefill_len
    }

    pub fn num_pending(&self) -> usize {
        self.handles.len()
    }

    pub fn handle(&self, request_id: RequestId) -> Option<&TransferHandle> {
        self.handles.get(&request_id)
    }

    /// Open a handoff for a request whose prefill just completed.
    pub fn initiate_handoff(
        &mut self,
        request_id: RequestId,
        num_tokens: usize,
        table: BlockTable,
        now_ms: u64,
    ) -> TransferId {
        let id = self.next_id;
        self.next_id += 1;
        let mut handle = TransferHandle {
            id,
            request_id,
            num_tokens,
            started_ms: now_ms,
            deadline_ms: now_ms.saturating_add(self.config.transfer_timeout_ms),
            state: TransferState::Pending,
            failure: None,
            table,
        };
        let payload = KvPayload { request_id, num_tokens, blocks: handle.table.blocks().to_vec() };
        if let Err(e) = self.transport.send_kv(&handle, payload) {
            warn!(request_id, transfer = id, "send_kv failed: {e:#}");
            handle.state = TransferState::Failed;
            handle.failure = Some(format!("{e:#}"));
        } else {
            debug!(request_id, transfer = id, num_tokens, "KV handoff started");
        }
        self.handles.insert(request_id, handle);
        id
    }

    /// Non-blocking check of one handoff. Resolved handles are dropped.
    pub fn poll(&mut self, request_id: RequestId, now_ms: u64) -> HandoffStatus {
        let Some(handle) = self.handles.get_mut(&request_id) else {
            return HandoffStatus::Failed(SchedulerError::UnknownRequest(request_id));
        };

        if handle.state == TransferState::Pending {
            if now_ms >= handle.deadline_ms {
                handle.state = TransferState::Failed;
                self.transport.abort(handle);
                let waited_ms = now_ms - handle.started_ms;
                warn!(request_id, transfer = handle.id, waited_ms, "KV handoff timed out");
                self.handles.remove(&request_id);
                return HandoffStatus::Failed(SchedulerError::TransferTimeout { request_id, waited_ms });
            }
            match self.transport.receive_kv(handle) {
                Ok(None) => return HandoffStatus::Pending,
                Ok(Some(payload))
                    if payload.request_id == request_id && payload.num_tokens == handle.num_tokens =>
                {
                    handle.state = TransferState::Complete;
                }
                Ok(Some(payload)) => {
                    handle.state = TransferState::Failed;
                    handle.failure = Some(format!(
                        "payload mismatch: got request {} with {} tokens",
                        payload.request_id, payload.num_tokens
                    ));
                }
                Err(e) => {
                    handle.state = TransferState::Failed;
                    handle.failure = Some(format!("{e:#}"));
                }
            }
        }

        let Some(handle) = self.handles.remove(&request_id) else {
            return HandoffStatus::Failed(SchedulerError::UnknownRequest(request_id));
        };
        match handle.state {
            TransferState::Complete => {
                info!(request_id, transfer = handle.id, blocks = handle.table.len(), "KV handoff complete");
                HandoffStatus::Complete(handle.table)
            }
            _ => {
                let reason = handle.failure.unwrap_or_else(|| "transfer failed".into());
                warn!(request_id, transfer = handle.id, %reason, "KV handoff failed");
                HandoffStatus::Failed(SchedulerError::TransferFailed { request_id, reason })
            }
        }
    }

    /// Poll every open handoff, in request id order.
    pub fn poll_all(&mut self, now_ms: u64) -> Vec<(RequestId, HandoffStatus)> {
        let mut ids: Vec<_> = self.handles.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| (id, self.poll(id, now_ms))).collect()
    }

    /// Abandon a handoff, e.g. when its request is cancelled.
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        match self.handles.remove(&request_id) {
            Some(handle) => {
                self.transport.abort(&handle);
                true
            }
            None => false,
        }
    }
}

type Outbox = HashMap<TransferId, (oneshot::Sender<KvPayload>, KvPayload)>;

/// In-process transport. Each transfer is a oneshot channel; the receiving
/// end is polled with `try_recv`, and the sending end is parked in an outbox
/// until the remote side delivers or drops it.
#[derive(Default)]
pub struct LoopbackTransport {
    auto_deliver: bool,
    inbox: HashMap<TransferId, oneshot::Receiver<KvPayload>>,
    outbox: Arc<Mutex<Outbox>>,
}

impl LoopbackTransport {
    /// Transfers stay pending until the [`LoopbackRemote`] acts on them.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer completes as soon as it is sent.
    pub fn immediate() -> Self {
        Self { auto_deliver: true, ..Self::default() }
    }

    pub fn remote(&self) -> LoopbackRemote {
        LoopbackRemote { outbox: Arc::clone(&self.outbox) }
    }
}

impl KvTransport for LoopbackTransport {
    fn send_kv(&mut self, handle: &TransferHandle, payload: KvPayload) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inbox.insert(handle.id, rx);
        if self.auto_deliver {
            if tx.send(payload).is_err() {
                bail!("loopback receiver for transfer {} closed", handle.id);
            }
        } else {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            outbox.insert(handle.id, (tx, payload));
        }
        Ok(())
    }

    fn receive_kv(&mut self, handle: &TransferHandle) -> anyhow::Result<Option<KvPayload>> {
        let Some(rx) = self.inbox.get_mut(&handle.id) else {
            bail!("no transfer {} in flight", handle.id);
        };
        match rx.try_recv() {
            Ok(payload) => {
                self.inbox.remove(&handle.id);
                Ok(Some(payload))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => {
                self.inbox.remove(&handle.id);
                bail!("transfer {} dropped by remote", handle.id)
            }
        }
    }

    fn abort(&mut self, handle: &TransferHandle) {
        self.inbox.remove(&handle.id);
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).remove(&handle.id);
    }
}

/// Remote end of a [`LoopbackTransport`].
#[derive(Clone)]
pub struct LoopbackRemote {
    outbox: Arc<Mutex<Outbox>>,
}

impl LoopbackRemote {
    /// Complete one transfer. Returns false if it is unknown or was aborted.
    pub fn deliver(&self, id: TransferId) -> bool {
        let entry = self.outbox.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        entry.is_some_and(|(tx, payload)| tx.send(payload).is_ok())
    }

    pub fn deliver_all(&self) -> usize {
        let drained: Vec<_> = self.outbox.lock().unwrap_or_else(PoisonError::into_inner).drain().collect();
        drained.into_iter().filter_map(|(_, (tx, payload))| tx.send(payload).ok()).count()
    }

    /// Drop a transfer's sender, failing it on the receiving side.
    pub fn fail(&self, id: TransferId) -> bool {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).remove(&id).is_some()
    }

    pub fn pending(&self) -> Vec<TransferId> {
        let mut ids: Vec<_> = self.outbox.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block_manager::BlockManager;

    fn table(blocks: usize) -> BlockTable {
        let mut manager = BlockManager::new(16, 4);
        manager.allocate(0, blocks).unwrap()
    }

    fn coordinator(transport: LoopbackTransport) -> DisaggCoordinator {
        let cfg = DisaggConfig { transfer_timeout_ms: 100, max_local_prefill_len: 32 };
        DisaggCoordinator::new(cfg, Box::new(transport))
    }

    #[test]
    fn test_remote_prefill_threshold() {
        let coord = coordinator(LoopbackTransport::new());
        assert!(!coord.should_prefill_remote(32, 0));
        assert!(coord.should_prefill_remote(33, 0));
        assert!(!coord.should_prefill_remote(48, 16));
    }

    #[test]
    fn test_pending_until_delivered() {
        let transport = LoopbackTransport::new();
        let remote = transport.remote();
        let mut coord = coordinator(transport);
        let id = coord.initiate_handoff(7, 10, table(3), 0);
        assert_eq!(coord.poll(7, 10), HandoffStatus::Pending);
        assert_eq!(coord.handle(7).map(TransferHandle::state), Some(TransferState::Pending));

        assert!(remote.deliver(id));
        match coord.poll(7, 20) {
            HandoffStatus::Complete(t) => assert_eq!(t.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(coord.num_pending(), 0);
    }

    #[test]
    fn test_timeout_fails_at_deadline() {
        let mut coord = coordinator(LoopbackTransport::new());
        coord.initiate_handoff(3, 8, table(2), 50);
        assert_eq!(coord.poll(3, 149), HandoffStatus::Pending);
        assert_eq!(
            coord.poll(3, 150),
            HandoffStatus::Failed(SchedulerError::TransferTimeout { request_id: 3, waited_ms: 100 })
        );
        assert_eq!(coord.num_pending(), 0);
    }

    #[test]
    fn test_dropped_sender_is_transfer_failure() {
        let transport = LoopbackTransport::new();
        let remote = transport.remote();
        let mut coord = coordinator(transport);
        let id = coord.initiate_handoff(1, 4, table(1), 0);
        assert!(remote.fail(id));
        assert!(matches!(
            coord.poll(1, 1),
            HandoffStatus::Failed(SchedulerError::TransferFailed { request_id: 1, .. })
        ));
    }

    #[test]
    fn test_immediate_transport_and_poll_all() {
        let mut coord = coordinator(LoopbackTransport::immediate());
        coord.initiate_handoff(5, 4, table(1), 0);
        coord.initiate_handoff(2, 4, table(1), 0);
        let resolved = coord.poll_all(1);
        assert_eq!(resolved.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2, 5]);
        assert!(resolved.iter().all(|(_, s)| matches!(s, HandoffStatus::Complete(_))));
    }

    #[test]
    fn test_cancel_aborts_remote_side() {
        let transport = LoopbackTransport::new();
        let remote = transport.remote();
        let mut coord = coordinator(transport);
        let id = coord.initiate_handoff(4, 4, table(1), 0);
        assert!(coord.cancel(4));
        assert!(!coord.cancel(4));
        assert!(!remote.deliver(id));
        assert!(remote.pending().is_empty());
    }
}
