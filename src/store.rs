//! Task store: the sole shared mutable resource of a run.
//!
//! All status changes go through compare-and-swap transitions taken under the
//! task's map entry lock, so two workers can never claim the same task.
//! Discovery queries (`list_unblocked`) may observe stale snapshots; only the
//! subsequent CAS commits anything.

use crate::error::{OrchestratorError, Result};
use crate::model::{Task, TaskId, TaskProgress, TaskStatus, WorkerId};
use crate::resolver;
use crate::storage::Storage;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct TaskStore {
    tasks: DashMap<TaskId, Task>,
    by_stream: DashMap<String, DashSet<TaskId>>,
    by_phase: DashMap<u32, DashSet<TaskId>>,
    /// Reverse dependency index: dependents[B] holds every task blocked by B.
    dependents: DashMap<TaskId, DashSet<TaskId>>,
    seq: AtomicU64,
    storage: Option<Arc<dyn Storage>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    /// Rebuild a store from persisted state after a coordinator crash.
    ///
    /// Tasks that were `InProgress` when the previous process died are
    /// reverted to `Pending` (their claim holder is gone) so a resumed run
    /// can re-claim them.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let store = Self::with_storage(storage.clone());
        let mut max_seq = 0;
        for mut task in storage.list_tasks()? {
            if task.status == TaskStatus::InProgress {
                warn!(
                    "Reverting orphaned in-progress task {} to pending on resume",
                    task.id
                );
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                storage.put_task(&task)?;
            }
            max_seq = max_seq.max(task.seq);
            store.index(&task);
            store.tasks.insert(task.id.clone(), task);
        }
        store.seq.store(max_seq + 1, Ordering::SeqCst);
        info!("Loaded {} tasks from storage", store.tasks.len());
        Ok(store)
    }

    fn index(&self, task: &Task) {
        self.by_stream
            .entry(task.stream.clone())
            .or_default()
            .insert(task.id.clone());
        self.by_phase
            .entry(task.phase)
            .or_default()
            .insert(task.id.clone());
        for dep in &task.blocked_by {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
        }
    }

    fn persist(&self, task: &Task) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.put_task(task)?;
        }
        Ok(())
    }

    /// Create a task. Fails if `blocked_by` references an unknown id.
    ///
    /// A task whose dependencies are all already satisfied (or empty) starts
    /// `Pending`; otherwise it starts `Blocked` and is promoted when its last
    /// dependency completes.
    pub fn create_task(
        &self,
        stream: &str,
        phase: u32,
        description: &str,
        blocked_by: Vec<TaskId>,
        max_retries: u32,
    ) -> Result<TaskId> {
        for dep in &blocked_by {
            if !self.tasks.contains_key(dep) {
                return Err(OrchestratorError::UnknownDependency {
                    dependency_id: dep.clone(),
                });
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("task-{}", seq);
        let satisfied = blocked_by
            .iter()
            .all(|dep| self.status_of(dep) == Some(TaskStatus::Completed));
        let now = chrono::Utc::now().naive_utc();
        let task = Task {
            id: id.clone(),
            stream: stream.to_string(),
            phase,
            status: if satisfied {
                TaskStatus::Pending
            } else {
                TaskStatus::Blocked
            },
            status_reason: None,
            description: description.to_string(),
            blocked_by,
            claimed_by: None,
            retry_count: 0,
            max_retries,
            seq,
            created_at: now,
            updated_at: now,
        };

        self.index(&task);
        self.persist(&task)?;
        debug!(
            "Created task {} ({}) in stream {} phase {} [{}]",
            id, description, stream, phase, task.status
        );
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| OrchestratorError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    pub fn get_status(&self, id: &str) -> Result<TaskStatus> {
        self.get_task(id).map(|t| t.status)
    }

    pub(crate) fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Compare-and-swap transition: succeeds only if the current status
    /// equals `from`. Completing a task promotes any dependents whose
    /// dependencies are now all satisfied.
    pub fn transition(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        self.transition_inner(id, from, to, None)
    }

    /// CAS claim: `Pending -> InProgress`, recording the claiming worker.
    /// Exactly one concurrent caller wins; the rest observe `Conflict`.
    pub fn claim(&self, id: &str, worker: &WorkerId) -> Result<()> {
        self.transition_inner(id, TaskStatus::Pending, TaskStatus::InProgress, Some(worker))
    }

    fn transition_inner(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        claimant: Option<&WorkerId>,
    ) -> Result<()> {
        // The phase barrier holds at the transition surface itself, not just
        // in discovery: no task enters InProgress while an earlier phase is
        // open. Checked before the entry lock (`prior_phases_complete` reads
        // other entries and must not run under it); once down, the barrier
        // stays down, so the check cannot go stale before the CAS commits.
        if to == TaskStatus::InProgress {
            let (status, phase) = {
                let entry =
                    self.tasks
                        .get(id)
                        .ok_or_else(|| OrchestratorError::TaskNotFound {
                            task_id: id.to_string(),
                        })?;
                (entry.status, entry.phase)
            };
            if status != from {
                return Err(OrchestratorError::Conflict {
                    task_id: id.to_string(),
                    expected: from,
                    found: status,
                });
            }
            if !resolver::prior_phases_complete(self, phase) {
                return Err(OrchestratorError::PhaseBarrier {
                    task_id: id.to_string(),
                    phase,
                });
            }
        }

        let snapshot = {
            let mut entry =
                self.tasks
                    .get_mut(id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound {
                        task_id: id.to_string(),
                    })?;
            if entry.status != from {
                return Err(OrchestratorError::Conflict {
                    task_id: id.to_string(),
                    expected: from,
                    found: entry.status,
                });
            }
            entry.status = to;
            match to {
                TaskStatus::InProgress => entry.claimed_by = claimant.cloned(),
                TaskStatus::Pending => entry.claimed_by = None,
                _ => {}
            }
            entry.updated_at = chrono::Utc::now().naive_utc();
            entry.clone()
        };

        debug!("Task {} transitioned {} -> {}", id, from, to);
        self.persist(&snapshot)?;

        if to == TaskStatus::Completed {
            self.promote_dependents(id);
        }
        Ok(())
    }

    /// Promote `Blocked` dependents of a completed task once their
    /// dependency sets are fully satisfied. Safe to race: completion is
    /// monotone, and the promotion itself is a CAS.
    fn promote_dependents(&self, completed_id: &str) {
        let dependent_ids: Vec<TaskId> = match self.dependents.get(completed_id) {
            Some(set) => set.iter().map(|id| id.clone()).collect(),
            None => return,
        };
        for dep_id in dependent_ids {
            let candidate = match self.tasks.get(&dep_id) {
                Some(t) => t.clone(),
                None => continue,
            };
            if candidate.status != TaskStatus::Blocked {
                continue;
            }
            if resolver::is_unblocked(self, &candidate) {
                match self.transition(&dep_id, TaskStatus::Blocked, TaskStatus::Pending) {
                    Ok(()) => info!("Task {} unblocked by completion of {}", dep_id, completed_id),
                    Err(OrchestratorError::Conflict { .. }) => {} // raced another completion
                    Err(e) => warn!("Failed to promote {}: {}", dep_id, e),
                }
            }
        }
    }

    /// Return a claimed task to `Pending` without counting it as a failure
    /// (shutdown revert, unverified-claim revocation).
    pub fn release(&self, id: &str) -> Result<()> {
        self.transition(id, TaskStatus::InProgress, TaskStatus::Pending)
    }

    /// Record a failed execution attempt: the task goes back to `Pending`
    /// and, once retries are exhausted, is flagged for operator attention.
    /// Returns true when the task was escalated.
    pub fn record_failure(&self, id: &str, reason: &str) -> Result<bool> {
        let (snapshot, escalated) = {
            let mut entry =
                self.tasks
                    .get_mut(id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound {
                        task_id: id.to_string(),
                    })?;
            if entry.status != TaskStatus::InProgress {
                return Err(OrchestratorError::Conflict {
                    task_id: id.to_string(),
                    expected: TaskStatus::InProgress,
                    found: entry.status,
                });
            }
            entry.status = TaskStatus::Pending;
            entry.claimed_by = None;
            entry.retry_count += 1;
            let escalated = entry.retry_count >= entry.max_retries;
            if escalated {
                entry.status_reason = Some(format!(
                    "failed after {} attempts: {}",
                    entry.retry_count, reason
                ));
            }
            entry.updated_at = chrono::Utc::now().naive_utc();
            (entry.clone(), escalated)
        };
        if escalated {
            warn!("Task {} escalated for operator attention: {}", id, reason);
        } else {
            debug!(
                "Task {} failed (attempt {}), returned to pending",
                id, snapshot.retry_count
            );
        }
        self.persist(&snapshot)?;
        Ok(escalated)
    }

    /// Operator intervention: clear an attention flag and reset the retry
    /// budget so workers pick the task up again.
    pub fn clear_attention(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut entry =
                self.tasks
                    .get_mut(id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound {
                        task_id: id.to_string(),
                    })?;
            entry.status_reason = None;
            entry.retry_count = 0;
            entry.updated_at = chrono::Utc::now().naive_utc();
            entry.clone()
        };
        self.persist(&snapshot)
    }

    /// Claimable tasks of a stream, FIFO by creation order: `Pending`, not
    /// flagged, dependencies satisfied, and the prior-phase barrier down.
    ///
    /// Recomputed on every call; callers must re-validate through `claim`.
    pub fn list_unblocked(&self, stream: &str) -> Vec<Task> {
        let ids: Vec<TaskId> = match self.by_stream.get(stream) {
            Some(set) => set.iter().map(|id| id.clone()).collect(),
            None => return Vec::new(),
        };
        let mut ready: Vec<Task> = ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.clone()))
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && !t.needs_attention()
                    && resolver::is_unblocked(self, t)
                    && resolver::prior_phases_complete(self, t.phase)
            })
            .collect();
        ready.sort_by_key(|t| t.seq);
        ready
    }

    /// Task ids of one phase, across all streams.
    pub(crate) fn phase_task_ids(&self, phase: u32) -> Vec<TaskId> {
        self.by_phase
            .get(&phase)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    /// First not-completed task of a stream at a phase, if any. Used by the
    /// bus to enforce the premature-send invariant.
    pub fn incomplete_in_stream_phase(&self, stream: &str, phase: u32) -> Option<TaskId> {
        let ids = self.phase_task_ids(phase);
        ids.into_iter().find(|id| {
            self.tasks
                .get(id)
                .map(|t| t.stream == stream && t.status != TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// A stream is drained when nothing claimable or runnable remains in it.
    /// Escalated tasks count as drained; tasks still `Blocked` do not (their
    /// worker keeps polling until the coordinator resolves the run).
    pub fn stream_drained(&self, stream: &str) -> bool {
        let ids: Vec<TaskId> = match self.by_stream.get(stream) {
            Some(set) => set.iter().map(|id| id.clone()).collect(),
            None => return true,
        };
        ids.iter().all(|id| {
            self.tasks
                .get(id)
                .map(|t| t.status == TaskStatus::Completed || t.needs_attention())
                .unwrap_or(true)
        })
    }

    pub fn all_completed(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.status == TaskStatus::Completed)
    }

    pub fn incomplete_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .count()
    }

    /// A run is stalled when incomplete tasks remain but nothing is running
    /// and nothing can be claimed: every path forward needs an operator.
    pub fn is_stalled(&self) -> bool {
        if self.all_completed() {
            return false;
        }
        let any_running = self
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::InProgress);
        if any_running {
            return false;
        }
        let streams: Vec<String> = self.by_stream.iter().map(|e| e.key().clone()).collect();
        !streams.iter().any(|s| !self.list_unblocked(s).is_empty())
    }

    /// Tasks currently claimed, with their claimants. Used by the gate's
    /// revocation sweep.
    pub fn claimed_tasks(&self) -> Vec<(TaskId, WorkerId)> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| t.claimed_by.clone().map(|w| (t.id.clone(), w)))
            .collect()
    }

    /// Read-only snapshot for the operator surface, in creation order.
    pub fn progress(&self) -> Vec<TaskProgress> {
        let mut rows: Vec<(u64, TaskProgress)> = self
            .tasks
            .iter()
            .map(|t| (t.seq, TaskProgress::from(&*t)))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStorage;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_create_task_rejects_unknown_dependency() {
        let store = TaskStore::new();
        let err = store
            .create_task("s1", 1, "a", vec!["ghost".to_string()], 3)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownDependency { .. }));
    }

    #[test]
    fn test_initial_status_from_dependencies() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        let b = store.create_task("s1", 1, "b", vec![a.clone()], 3).unwrap();
        assert_eq!(store.get_status(&a).unwrap(), TaskStatus::Pending);
        assert_eq!(store.get_status(&b).unwrap(), TaskStatus::Blocked);
    }

    #[test]
    fn test_cas_transition_conflict() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        let worker = "w1".to_string();
        store.claim(&a, &worker).unwrap();

        let err = store.claim(&a, &"w2".to_string()).unwrap_err();
        match err {
            OrchestratorError::Conflict {
                expected, found, ..
            } => {
                assert_eq!(expected, TaskStatus::Pending);
                assert_eq!(found, TaskStatus::InProgress);
            }
            other => panic!("expected Conflict, got {}", other),
        }
        assert_eq!(
            store.get_task(&a).unwrap().claimed_by,
            Some("w1".to_string())
        );
    }

    #[test]
    fn test_completion_promotes_dependents() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        let b = store.create_task("s2", 1, "b", vec![], 3).unwrap();
        let c = store
            .create_task("s1", 2, "c", vec![a.clone(), b.clone()], 3)
            .unwrap();

        let worker = "w1".to_string();
        store.claim(&a, &worker).unwrap();
        store
            .transition(&a, TaskStatus::InProgress, TaskStatus::Completed)
            .unwrap();
        // One of two dependencies done: still blocked.
        assert_eq!(store.get_status(&c).unwrap(), TaskStatus::Blocked);

        store.claim(&b, &worker).unwrap();
        store
            .transition(&b, TaskStatus::InProgress, TaskStatus::Completed)
            .unwrap();
        assert_eq!(store.get_status(&c).unwrap(), TaskStatus::Pending);
    }

    #[test]
    fn test_list_unblocked_enforces_phase_barrier() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        // Phase 2 task with no explicit deps: still gated by the barrier.
        let b = store.create_task("s1", 2, "b", vec![], 3).unwrap();

        let ready: Vec<String> = store
            .list_unblocked("s1")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![a.clone()]);

        let worker = "w1".to_string();
        store.claim(&a, &worker).unwrap();
        store
            .transition(&a, TaskStatus::InProgress, TaskStatus::Completed)
            .unwrap();
        let ready: Vec<String> = store
            .list_unblocked("s1")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![b]);
    }

    #[test]
    fn test_claim_rejected_while_earlier_phase_open() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        // Phase 2, empty dependency set: Pending from birth, but the barrier
        // must still refuse the claim while phase 1 is open.
        let b = store.create_task("s2", 2, "b", vec![], 3).unwrap();

        let worker = "w1".to_string();
        let err = store.claim(&b, &worker).unwrap_err();
        assert!(matches!(err, OrchestratorError::PhaseBarrier { .. }));
        assert_eq!(store.get_status(&b).unwrap(), TaskStatus::Pending);
        assert_eq!(store.get_task(&b).unwrap().claimed_by, None);

        store.claim(&a, &worker).unwrap();
        store
            .transition(&a, TaskStatus::InProgress, TaskStatus::Completed)
            .unwrap();
        store.claim(&b, &worker).unwrap();
    }

    #[test]
    fn test_list_unblocked_is_fifo_by_creation() {
        let store = TaskStore::new();
        let first = store.create_task("s1", 1, "first", vec![], 3).unwrap();
        let second = store.create_task("s1", 1, "second", vec![], 3).unwrap();
        let ready: Vec<String> = store
            .list_unblocked("s1")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![first, second]);
    }

    #[test]
    fn test_record_failure_escalates_after_retries() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 2).unwrap();
        let worker = "w1".to_string();

        store.claim(&a, &worker).unwrap();
        assert!(!store.record_failure(&a, "boom").unwrap());
        assert_eq!(store.get_status(&a).unwrap(), TaskStatus::Pending);
        assert!(!store.get_task(&a).unwrap().needs_attention());

        store.claim(&a, &worker).unwrap();
        assert!(store.record_failure(&a, "boom").unwrap());
        let task = store.get_task(&a).unwrap();
        assert!(task.needs_attention());
        // Escalated tasks are never offered for claiming again.
        assert!(store.list_unblocked("s1").is_empty());
        assert!(store.stream_drained("s1"));

        store.clear_attention(&a).unwrap();
        assert_eq!(store.list_unblocked("s1").len(), 1);
    }

    #[test]
    fn test_stall_detection() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 1).unwrap();
        let b = store.create_task("s1", 2, "b", vec![a.clone()], 3).unwrap();
        assert!(!store.is_stalled());

        let worker = "w1".to_string();
        store.claim(&a, &worker).unwrap();
        assert!(!store.is_stalled());
        store.record_failure(&a, "boom").unwrap();

        // a is escalated, b is blocked behind it: nothing can move.
        assert!(store.is_stalled());
        assert_eq!(store.get_status(&b).unwrap(), TaskStatus::Blocked);
    }

    #[test]
    fn test_no_double_claim_under_contention() {
        let store = Arc::new(TaskStore::new());
        let id = store.create_task("s1", 1, "contested", vec![], 3).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                store.claim(&id, &format!("w{}", i)).is_ok()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_persistence_and_resume() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(SledStorage::new(dir.path()).unwrap());
        let (a, b) = {
            let store = TaskStore::with_storage(storage.clone());
            let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
            let b = store.create_task("s1", 1, "b", vec![], 3).unwrap();
            let worker = "w1".to_string();
            store.claim(&a, &worker).unwrap();
            store
                .transition(&a, TaskStatus::InProgress, TaskStatus::Completed)
                .unwrap();
            store.claim(&b, &worker).unwrap();
            // b is left in-progress, simulating a crash mid-execution.
            (a, b)
        };

        let resumed = TaskStore::load(storage).unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed.get_status(&a).unwrap(), TaskStatus::Completed);
        // The orphaned claim was reverted so the resumed run can re-claim it.
        assert_eq!(resumed.get_status(&b).unwrap(), TaskStatus::Pending);
        assert_eq!(resumed.get_task(&b).unwrap().claimed_by, None);
        // Sequence numbers keep increasing after resume.
        let c = resumed.create_task("s1", 1, "c", vec![], 3).unwrap();
        assert!(resumed.get_task(&c).unwrap().seq > resumed.get_task(&b).unwrap().seq);
    }
}
