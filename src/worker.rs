//! Worker: the per-stream task executor.
//!
//! One worker serves exactly one stream. Its loop is a small state machine:
//! Idle -> Verifying -> Ready -> (Executing -> Idle)* -> Done. Claims go
//! through the verification gate and the store's CAS, so racing claimants
//! lose with `Conflict` and simply move to the next candidate.

use crate::bus::CommunicationBus;
use crate::error::{OrchestratorError, Result};
use crate::gate::VerificationGate;
use crate::model::{Task, TaskStatus, WorkerId};
use crate::plan::CommunicationRule;
use crate::store::TaskStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The work itself. Implementations produce the task's artifact; the engine
/// only cares whether they succeeded.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Capability modules this handler has loaded. Declared to the
    /// verification gate before any claim is attempted.
    fn capabilities(&self) -> Vec<String>;

    async fn execute(&self, task: &Task, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// What a handler gets to work with: the store for lookups and the bus for
/// cross-stream waits (e.g. blocking on an upstream interface description).
pub struct HandlerContext {
    pub store: Arc<TaskStore>,
    pub bus: Arc<CommunicationBus>,
    pub stream: String,
}

#[derive(Debug, Default, Clone)]
pub struct WorkerReport {
    pub worker: WorkerId,
    pub stream: String,
    pub completed: usize,
    pub failed_attempts: usize,
    pub escalated: usize,
}

pub struct Worker {
    id: WorkerId,
    stream: String,
    store: Arc<TaskStore>,
    gate: Arc<VerificationGate>,
    bus: Arc<CommunicationBus>,
    handler: Arc<dyn TaskHandler>,
    rules: Vec<CommunicationRule>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: String,
        store: Arc<TaskStore>,
        gate: Arc<VerificationGate>,
        bus: Arc<CommunicationBus>,
        handler: Arc<dyn TaskHandler>,
        rules: Vec<CommunicationRule>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let id = format!("worker-{}", uuid::Uuid::new_v4());
        Self {
            id,
            stream,
            store,
            gate,
            bus,
            handler,
            rules,
            shutdown,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Drive the stream to completion.
    ///
    /// Verification happens first and is mandatory: a worker whose handler
    /// cannot cover the stream's required capabilities never enters the
    /// claim loop. The loop exits `Done` when the stream is drained, or
    /// early on a shutdown signal.
    pub async fn run(self) -> Result<WorkerReport> {
        info!("Worker {} starting on stream {}", self.id, self.stream);
        let mut report = WorkerReport {
            worker: self.id.clone(),
            stream: self.stream.clone(),
            ..WorkerReport::default()
        };

        // Idle -> Verifying -> Ready
        self.gate
            .declare_capabilities(&self.id, &self.stream, &self.handler.capabilities())?;

        let mut interval = tokio::time::interval(self.poll_interval);
        let mut shutdown_rx = self.shutdown.clone();
        loop {
            tokio::select! {
                // The coordinator only ever raises the flag, so any change
                // (or a dropped sender) means stop.
                _ = shutdown_rx.changed() => {
                    info!("Worker {} received shutdown", self.id);
                    break;
                }
                _ = interval.tick() => {
                    let candidates = self.store.list_unblocked(&self.stream);
                    if candidates.is_empty() {
                        if self.store.stream_drained(&self.stream) {
                            info!("Worker {} done: stream {} drained", self.id, self.stream);
                            break;
                        }
                        continue;
                    }
                    for candidate in candidates {
                        if *self.shutdown.borrow() {
                            break;
                        }
                        // Ready -> Executing requires the gate, every time.
                        self.gate.ensure_verified(&self.id)?;
                        match self.store.claim(&candidate.id, &self.id) {
                            Ok(()) => self.execute_one(candidate, &mut report).await,
                            Err(OrchestratorError::Conflict { task_id, .. }) => {
                                // Lost the race; try the next candidate.
                                debug!("Worker {} lost claim race on {}", self.id, task_id);
                            }
                            Err(OrchestratorError::PhaseBarrier { task_id, .. }) => {
                                // An earlier phase reopened since listing
                                // (tasks can be created mid-run); re-list on
                                // the next tick.
                                debug!("Worker {} held at phase barrier on {}", self.id, task_id);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        info!(
            "Worker {} exiting: {} completed, {} failed attempts, {} escalated",
            self.id, report.completed, report.failed_attempts, report.escalated
        );
        Ok(report)
    }

    /// Executing -> Idle. A claimed task is never abandoned mid-state: the
    /// handler call runs to completion and the outcome is recorded as either
    /// a completion or a failure-with-retry.
    async fn execute_one(&self, task: Task, report: &mut WorkerReport) {
        debug!(
            "Worker {} executing {} ({})",
            self.id, task.id, task.description
        );
        match self.handler.execute(&task, &self.context()).await {
            Ok(()) => {
                match self
                    .store
                    .transition(&task.id, TaskStatus::InProgress, TaskStatus::Completed)
                {
                    Ok(()) => {
                        report.completed += 1;
                        self.fire_communication(&task);
                    }
                    Err(e) => error!("Worker {} could not complete {}: {}", self.id, task.id, e),
                }
            }
            Err(e) => {
                warn!("Worker {} failed {}: {}", self.id, task.id, e);
                report.failed_attempts += 1;
                match self.store.record_failure(&task.id, &e.to_string()) {
                    Ok(true) => report.escalated += 1,
                    Ok(false) => {}
                    Err(err) => error!(
                        "Worker {} could not record failure on {}: {}",
                        self.id, task.id, err
                    ),
                }
            }
        }
    }

    fn context(&self) -> HandlerContext {
        HandlerContext {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            stream: self.stream.clone(),
        }
    }

    /// Fire declared communication rules whose trigger phase just finished.
    /// The completion that closes out `(stream, phase)` sends the handoff;
    /// the bus re-validates, so a mistimed call surfaces as `PrematureSend`
    /// instead of leaking an early message.
    fn fire_communication(&self, completed: &Task) {
        for rule in &self.rules {
            if rule.from != self.stream || rule.trigger_phase != completed.phase {
                continue;
            }
            if self
                .store
                .incomplete_in_stream_phase(&self.stream, completed.phase)
                .is_some()
            {
                continue;
            }
            match self.bus.send(
                &rule.from,
                &rule.to,
                rule.trigger_phase,
                rule.payload.clone(),
            ) {
                Ok(id) => info!(
                    "Worker {} sent handoff {} ({} -> {} at phase {})",
                    self.id, id, rule.from, rule.to, rule.trigger_phase
                ),
                // Fatal to this send only, never to the run.
                Err(e) => warn!("Worker {} handoff rejected: {}", self.id, e),
            }
        }
    }
}
