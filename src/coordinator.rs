//! Coordinator: owns the run from plan ingestion to teardown.
//!
//! Ingests a validated execution plan, populates the task store (each task
//! blocked by the whole previous phase plus its declared chunk deps), spawns
//! one worker per stream referenced by the plan, polls until the run either
//! completes or can no longer make progress, and broadcasts shutdown.

use crate::bus::CommunicationBus;
use crate::error::{OrchestratorError, Result};
use crate::gate::VerificationGate;
use crate::model::{TaskId, TaskProgress};
use crate::plan::ExecutionPlan;
use crate::registry::StreamRegistry;
use crate::storage::Storage;
use crate::store::TaskStore;
use crate::worker::{TaskHandler, Worker, WorkerReport};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the coordinator re-checks global run state.
    pub poll_interval: Duration,
    /// Poll interval handed to each worker.
    pub worker_poll_interval: Duration,
    /// Retry budget for tasks created from the plan.
    pub default_max_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            worker_poll_interval: Duration::from_millis(25),
            default_max_retries: 3,
        }
    }
}

/// The run's single success signal. Emitted at most once, only when every
/// task across every phase completed; partial completion never emits it.
#[derive(Default)]
pub struct CompletionSignal {
    emitted: AtomicBool,
    notify: Notify,
}

impl CompletionSignal {
    /// Returns true only for the first call.
    pub fn emit(&self) -> bool {
        let first = !self.emitted.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_emitted(&self) -> bool {
        self.emitted.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while !self.is_emitted() {
            let notified = self.notify.notified();
            if self.is_emitted() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub overall_success: bool,
    pub completed: usize,
    /// Tasks flagged for operator attention, with their reasons.
    pub attention: Vec<TaskProgress>,
    pub workers: Vec<WorkerReport>,
}

pub struct Coordinator {
    store: Arc<TaskStore>,
    registry: Arc<StreamRegistry>,
    gate: Arc<VerificationGate>,
    bus: Arc<CommunicationBus>,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    completion: Arc<CompletionSignal>,
    storage: Option<Arc<dyn Storage>>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::build(Arc::new(TaskStore::new()), None, config)
    }

    /// Coordinator whose store mirrors every mutation into `storage`.
    pub fn with_storage(config: CoordinatorConfig, storage: Arc<dyn Storage>) -> Self {
        Self::build(
            Arc::new(TaskStore::with_storage(storage.clone())),
            Some(storage),
            config,
        )
    }

    /// Resume a crashed run: rebuild the store from persisted state instead
    /// of re-ingesting the plan's chunks. The plan is still needed for
    /// stream specs and communication rules.
    pub fn resume(config: CoordinatorConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let store = Arc::new(TaskStore::load(storage.clone())?);
        Ok(Self::build(store, Some(storage), config))
    }

    fn build(
        store: Arc<TaskStore>,
        storage: Option<Arc<dyn Storage>>,
        config: CoordinatorConfig,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::new());
        let gate = Arc::new(VerificationGate::new(Arc::clone(&registry)));
        let bus = Arc::new(CommunicationBus::new(Arc::clone(&store)));
        Self {
            store,
            registry,
            gate,
            bus,
            handlers: DashMap::new(),
            completion: Arc::new(CompletionSignal::default()),
            storage,
            config,
        }
    }

    /// Register the handler that performs this stream's work. Must cover
    /// every stream the plan references before `run` is called.
    pub fn register_handler(&self, stream: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(stream.to_string(), handler);
    }

    pub fn store(&self) -> Arc<TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn bus(&self) -> Arc<CommunicationBus> {
        Arc::clone(&self.bus)
    }

    pub fn completion_signal(&self) -> Arc<CompletionSignal> {
        Arc::clone(&self.completion)
    }

    /// Read-only progress surface for operators and audit.
    pub fn progress(&self) -> Vec<TaskProgress> {
        self.store.progress()
    }

    /// Execute the plan to completion (or to a stall).
    ///
    /// On a resumed coordinator the store is already populated and only the
    /// streams/rules are taken from the plan.
    pub async fn run(&self, plan: &ExecutionPlan) -> Result<RunReport> {
        plan.validate()?;
        for stream in &plan.streams {
            self.registry.register(stream.clone())?;
        }
        if self.store.is_empty() {
            self.populate(plan)?;
        } else {
            info!(
                "Resuming with {} tasks already in the store",
                self.store.len()
            );
        }
        self.execute(plan).await
    }

    /// Turn the plan's chunks into tasks. Each task is blocked by the union
    /// of (a) every task of the immediately preceding phase and (b) its
    /// declared chunk-level dependencies.
    fn populate(&self, plan: &ExecutionPlan) -> Result<()> {
        let mut name_to_id: HashMap<String, TaskId> = HashMap::new();
        let mut prev_phase_ids: Vec<TaskId> = Vec::new();

        for phase_idx in 0..plan.phases.len() {
            let phase = (phase_idx + 1) as u32;
            let mut this_phase_ids = Vec::new();
            for chunk in plan.ordered_chunks(phase_idx)? {
                let mut blocked_by = prev_phase_ids.clone();
                for dep in &chunk.depends_on {
                    let dep_id = name_to_id.get(dep).ok_or_else(|| {
                        OrchestratorError::PlanValidation(format!(
                            "chunk {} depends on unknown chunk {}",
                            chunk.name, dep
                        ))
                    })?;
                    if !blocked_by.contains(dep_id) {
                        blocked_by.push(dep_id.clone());
                    }
                }
                let description = chunk.description.as_deref().unwrap_or(&chunk.name);
                let id = self.store.create_task(
                    &chunk.stream,
                    phase,
                    description,
                    blocked_by,
                    self.config.default_max_retries,
                )?;
                name_to_id.insert(chunk.name.clone(), id.clone());
                this_phase_ids.push(id);
            }
            prev_phase_ids = this_phase_ids;
        }
        info!(
            "Populated store with {} tasks across {} phases",
            self.store.len(),
            plan.phases.len()
        );
        Ok(())
    }

    async fn execute(&self, plan: &ExecutionPlan) -> Result<RunReport> {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        // One worker per distinct stream the plan's chunks reference.
        let mut streams: Vec<String> = plan
            .phases
            .iter()
            .flat_map(|p| p.chunks.iter().map(|c| c.stream.clone()))
            .collect();
        streams.sort();
        streams.dedup();

        let mut handles: Vec<(String, JoinHandle<Result<WorkerReport>>)> = Vec::new();
        for stream in &streams {
            let handler = self
                .handlers
                .get(stream)
                .map(|h| Arc::clone(&*h))
                .ok_or_else(|| OrchestratorError::WorkerNotRegistered {
                    stream: stream.clone(),
                })?;
            let worker = Worker::new(
                stream.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.gate),
                Arc::clone(&self.bus),
                handler,
                plan.communication.clone(),
                shutdown_tx.subscribe(),
            )
            .with_poll_interval(self.config.worker_poll_interval);
            self.registry.bind(stream, worker.id())?;
            info!("Spawning worker {} for stream {}", worker.id(), stream);
            handles.push((stream.clone(), tokio::spawn(worker.run())));
        }

        let success = self.poll_until_settled(&handles).await;

        if success {
            if self.completion.emit() {
                info!("Run complete: all tasks completed, emitting completion marker");
                if let Some(storage) = &self.storage {
                    storage.set_completed()?;
                }
            }
        } else {
            warn!(
                "Run did not complete: {} tasks incomplete",
                self.store.incomplete_count()
            );
        }

        // Teardown: broadcast shutdown and collect worker reports.
        let _ = shutdown_tx.send(true);
        let mut workers = Vec::new();
        for (stream, handle) in handles {
            match handle.await {
                Ok(Ok(report)) => workers.push(report),
                Ok(Err(e)) => error!("Worker for stream {} failed: {}", stream, e),
                Err(e) => error!("Worker task for stream {} panicked: {}", stream, e),
            }
        }
        // Anything claimed by a worker that never verified goes back.
        self.gate.revoke_unverified_claims(&self.store);

        let attention: Vec<TaskProgress> = self
            .store
            .progress()
            .into_iter()
            .filter(|row| row.blocked_on_failure())
            .collect();
        Ok(RunReport {
            overall_success: success,
            completed: self.store.len() - self.store.incomplete_count(),
            attention,
            workers,
        })
    }

    /// Poll until every task is completed, or until no live worker can make
    /// progress (the bounded failure threshold: escalated tasks, dead
    /// workers, or a wedged dependency chain).
    async fn poll_until_settled(
        &self,
        handles: &[(String, JoinHandle<Result<WorkerReport>>)],
    ) -> bool {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            interval.tick().await;
            self.gate.revoke_unverified_claims(&self.store);

            if self.store.all_completed() {
                return true;
            }
            let any_running = !self.store.claimed_tasks().is_empty();
            if any_running {
                continue;
            }
            let progress_possible = handles.iter().any(|(stream, handle)| {
                !handle.is_finished() && !self.store.list_unblocked(stream).is_empty()
            });
            if !progress_possible {
                // A worker may have completed the final task, or claimed one,
                // between the reads above; a stale empty listing must not be
                // mistaken for a stall while a task is mid-execution.
                if self.store.all_completed() {
                    return true;
                }
                if !self.store.claimed_tasks().is_empty() {
                    continue;
                }
                let still_listed = handles.iter().any(|(stream, handle)| {
                    !handle.is_finished() && !self.store.list_unblocked(stream).is_empty()
                });
                if still_listed {
                    continue;
                }
                warn!(
                    "Run stalled: {} incomplete, nothing claimable by a live worker",
                    self.store.incomplete_count()
                );
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::worker::HandlerContext;
    use async_trait::async_trait;

    struct EchoHandler {
        caps: Vec<String>,
    }

    #[async_trait]
    impl TaskHandler for EchoHandler {
        fn capabilities(&self) -> Vec<String> {
            self.caps.clone()
        }

        async fn execute(&self, _task: &Task, _ctx: &HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn two_stream_plan() -> ExecutionPlan {
        ExecutionPlan::from_yaml(
            r#"
streams:
  - name: s1
    owned_resources: [src/api]
    required_capabilities: [api]
  - name: s2
    owned_resources: [src/ui]
    required_capabilities: [ui]
phases:
  - chunks:
      - name: api-scaffold
        stream: s1
      - name: ui-scaffold
        stream: s2
  - chunks:
      - name: api-endpoints
        stream: s1
      - name: ui-views
        stream: s2
        depends_on: [api-endpoints]
communication:
  - from: s1
    to: s2
    trigger_phase: 1
    payload: "api surface"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_run_emits_completion_once() {
        let plan = two_stream_plan();
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.register_handler(
            "s1",
            Arc::new(EchoHandler {
                caps: vec!["api".to_string()],
            }),
        );
        coordinator.register_handler(
            "s2",
            Arc::new(EchoHandler {
                caps: vec!["ui".to_string()],
            }),
        );

        let report = coordinator.run(&plan).await.unwrap();
        assert!(report.overall_success);
        assert_eq!(report.completed, 4);
        assert!(report.attention.is_empty());
        assert!(coordinator.completion_signal().is_emitted());
        // Marker is idempotent: a second emit is a no-op.
        assert!(!coordinator.completion_signal().emit());
    }

    struct SlowHandler {
        caps: Vec<String>,
        delay: Duration,
    }

    #[async_trait]
    impl TaskHandler for SlowHandler {
        fn capabilities(&self) -> Vec<String> {
            self.caps.clone()
        }

        async fn execute(&self, _task: &Task, _ctx: &HandlerContext) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    // Handlers that hold tasks in flight across many coordinator polls must
    // not be mistaken for a stalled run, whatever the interleaving of the
    // coordinator's reads with the worker's claims.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_handlers_are_not_a_stall() {
        let yaml = r#"
streams:
  - name: s1
    required_capabilities: []
phases:
  - chunks:
      - name: a
        stream: s1
      - name: b
        stream: s1
      - name: c
        stream: s1
"#;
        let plan = ExecutionPlan::from_yaml(yaml).unwrap();
        let config = CoordinatorConfig {
            poll_interval: Duration::from_millis(2),
            worker_poll_interval: Duration::from_millis(2),
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::new(config);
        coordinator.register_handler(
            "s1",
            Arc::new(SlowHandler {
                caps: vec![],
                delay: Duration::from_millis(25),
            }),
        );

        let report = coordinator.run(&plan).await.unwrap();
        assert!(report.overall_success, "run falsely stalled: {:?}", report);
        assert_eq!(report.completed, 3);
    }

    #[tokio::test]
    async fn test_missing_handler_rejected_before_spawn() {
        let plan = two_stream_plan();
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.register_handler(
            "s1",
            Arc::new(EchoHandler {
                caps: vec!["api".to_string()],
            }),
        );
        let err = coordinator.run(&plan).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::WorkerNotRegistered { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_plan_creates_no_tasks() {
        let yaml = r#"
streams:
  - name: s1
    owned_resources: [x]
  - name: s2
    owned_resources: [x]
phases:
  - chunks:
      - name: a
        stream: s1
"#;
        // Overlap is caught at parse time; validate() also guards run().
        assert!(ExecutionPlan::from_yaml(yaml).is_err());

        let plan = ExecutionPlan {
            streams: vec![],
            phases: vec![],
            communication: vec![],
        };
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let err = coordinator.run(&plan).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanValidation(_)));
        assert!(coordinator.store().is_empty());
        assert!(!coordinator.completion_signal().is_emitted());
    }

    #[tokio::test]
    async fn test_completion_signal_wait() {
        let signal = Arc::new(CompletionSignal::default());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(signal.emit());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait() should resolve after emit")
            .unwrap();
    }
}
