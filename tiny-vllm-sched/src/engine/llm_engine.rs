use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{error, warn};

use anyhow::{bail, Result};

use crate::engine::scheduler::{BatchDescriptor, BatchOutput, Scheduler};
use crate::engine::sequence::{Request, RequestId, RequestOutput, RequestStatus};
use crate::error::SchedulerError;

// =============================
// Engine State
// =============================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum EngineState {
    #[default]
    Running,
    Stopped,
}

// =============================
// Executor
// =============================

/// Where finished batches are reported. Cloned into every launch.
pub type CompletionSender = mpsc::UnboundedSender<BatchOutput>;

/// Model-execution collaborator. `execute` launches a batch and returns; the
/// result goes through `done` whenever it is ready, possibly from another
/// thread.
pub trait Executor {
    fn execute(&mut self, batch: &BatchDescriptor, done: CompletionSender) -> Result<()>;
}

/// What one [`LlmEngine::step`] did.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Batch launched in this step, if any.
    pub launched: Option<BatchDescriptor>,
    /// Batches whose results were applied before scheduling.
    pub completed: usize,
}

// =============================
// LlmEngine Struct
// =============================

/// Drives a [`Scheduler`] against an [`Executor`], keeping up to
/// `max_in_flight` batches outstanding.
pub struct LlmEngine<E> {
    scheduler: Scheduler,
    executor: E,
    completions_tx: CompletionSender,
    completions_rx: mpsc::UnboundedReceiver<BatchOutput>,
    max_in_flight: usize,
    state: EngineState,
}

impl<E: Executor> LlmEngine<E> {
    pub fn new(scheduler: Scheduler, executor: E) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            scheduler,
            executor,
            completions_tx,
            completions_rx,
            max_in_flight: 2,
            state: EngineState::Running,
        }
    }

    /// Pipeline depth. 1 means every batch completes before the next is built.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn submit(&mut self, request: Request) -> Result<RequestId> {
        if self.state == EngineState::Stopped {
            bail!("engine is stopped");
        }
        Ok(self.scheduler.submit(request)?)
    }

    pub fn cancel(&mut self, id: RequestId) -> Result<()> {
        Ok(self.scheduler.cancel(id)?)
    }

    pub fn status(&self, id: RequestId) -> Result<RequestStatus> {
        Ok(self.scheduler.status(id)?)
    }

    fn apply(&mut self, output: BatchOutput) -> Result<()> {
        match self.scheduler.complete(output) {
            // results of an aborted batch arriving late
            Err(SchedulerError::UnknownBatch(batch_id)) => {
                warn!(batch_id, "dropping output for unknown batch");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn drain_completions(&mut self) -> Result<usize> {
        let mut applied = 0;
        loop {
            match self.completions_rx.try_recv() {
                Ok(output) => {
                    self.apply(output)?;
                    applied += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(applied),
            }
        }
    }

    /// Apply finished batches, then schedule and launch the next one if the
    /// pipeline has room.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.state == EngineState::Stopped {
            bail!("engine is stopped");
        }
        let completed = self.drain_completions()?;
        if self.scheduler.num_in_flight() >= self.max_in_flight {
            return Ok(StepOutcome { launched: None, completed });
        }

        let batch = self.scheduler.tick()?;
        if batch.is_empty() {
            return Ok(StepOutcome { launched: None, completed });
        }
        if let Err(e) = self.executor.execute(&batch, self.completions_tx.clone()) {
            error!(batch_id = batch.batch_id, "executor rejected batch: {e:#}");
            self.scheduler.abort_batch(batch.batch_id, &format!("{e:#}"))?;
            return Ok(StepOutcome { launched: None, completed });
        }
        Ok(StepOutcome { launched: Some(batch), completed })
    }

    /// Step until every request has finished or `max_steps` is reached,
    /// blocking on the completion channel when only in-flight work is left.
    /// Must not be called from inside an async runtime.
    pub fn run_until_idle(&mut self, max_steps: usize) -> Result<Vec<RequestOutput>> {
        let mut finished = Vec::new();
        for _ in 0..max_steps {
            if self.scheduler.is_idle() {
                break;
            }
            let outcome = self.step()?;
            finished.extend(self.scheduler.drain_finished());
            let stalled = outcome.launched.is_none() && outcome.completed == 0;
            if stalled && self.scheduler.num_in_flight() > 0 {
                match self.completions_rx.blocking_recv() {
                    Some(output) => self.apply(output)?,
                    None => break,
                }
            }
        }
        finished.extend(self.scheduler.drain_finished());
        Ok(finished)
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// Refuse new work. In-flight results are still accepted by `step` until
    /// the engine is dropped.
    pub fn shutdown(&mut self) {
        self.state = EngineState::Stopped;
    }
}
