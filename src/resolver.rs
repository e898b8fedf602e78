//! Dependency resolution: pure reads over task store state.
//!
//! The phase barrier lives here, not in worker discipline: a task in phase N
//! is never claimable while any task in an earlier phase is incomplete, no
//! matter what its explicit dependency set says.

use crate::model::{Task, TaskStatus};
use crate::store::TaskStore;

/// All blocking tasks completed. A task with no dependencies is unblocked
/// immediately. An unknown dependency id counts as unsatisfied.
pub fn is_unblocked(store: &TaskStore, task: &Task) -> bool {
    task.blocked_by
        .iter()
        .all(|dep| store.status_of(dep) == Some(TaskStatus::Completed))
}

/// Whether every task in `phase` (across all streams) is completed.
/// A phase with no tasks is vacuously complete.
pub fn phase_complete(store: &TaskStore, phase: u32) -> bool {
    store
        .phase_task_ids(phase)
        .iter()
        .all(|id| store.status_of(id) == Some(TaskStatus::Completed))
}

/// The hard barrier: all phases strictly before `phase` are complete.
pub fn prior_phases_complete(store: &TaskStore, phase: u32) -> bool {
    (1..phase).all(|earlier| phase_complete(store, earlier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_dependency_set_is_unblocked() {
        let store = TaskStore::new();
        let id = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        let task = store.get_task(&id).unwrap();
        assert!(is_unblocked(&store, &task));
    }

    #[test]
    fn test_unblocked_tracks_dependency_completion() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        let b = store.create_task("s1", 1, "b", vec![a.clone()], 3).unwrap();
        let task_b = store.get_task(&b).unwrap();
        assert!(!is_unblocked(&store, &task_b));

        let worker = "w1".to_string();
        store.claim(&a, &worker).unwrap();
        store
            .transition(&a, TaskStatus::InProgress, TaskStatus::Completed)
            .unwrap();
        assert!(is_unblocked(&store, &task_b));
    }

    #[test]
    fn test_phase_barrier_spans_streams() {
        let store = TaskStore::new();
        let a = store.create_task("s1", 1, "a", vec![], 3).unwrap();
        let b = store.create_task("s2", 1, "b", vec![], 3).unwrap();

        assert!(!prior_phases_complete(&store, 2));

        let worker = "w1".to_string();
        for id in [&a, &b] {
            store.claim(id, &worker).unwrap();
            store
                .transition(id, TaskStatus::InProgress, TaskStatus::Completed)
                .unwrap();
        }
        assert!(prior_phases_complete(&store, 2));
        // Phase 1 itself needs no earlier phases.
        assert!(prior_phases_complete(&store, 1));
    }
}
