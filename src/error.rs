use crate::model::{TaskStatus, WorkerId};
use std::time::Duration;
use thiserror::Error;

/// Orchestration errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    // Plan ingestion
    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    // Task store
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Unknown dependency: task references undeclared id {dependency_id}")]
    UnknownDependency { dependency_id: String },

    #[error("Transition conflict on {task_id}: expected {expected:?}, found {found:?}")]
    Conflict {
        task_id: String,
        expected: TaskStatus,
        found: TaskStatus,
    },

    // Streams and workers
    #[error("Phase barrier: task {task_id} is in phase {phase} and an earlier phase is incomplete")]
    PhaseBarrier { task_id: String, phase: u32 },

    #[error("Stream not found: {stream}")]
    StreamNotFound { stream: String },

    #[error("Stream {stream} is already bound to worker {worker}")]
    StreamAlreadyBound { stream: String, worker: WorkerId },

    #[error("No handler registered for stream: {stream}")]
    WorkerNotRegistered { stream: String },

    // Verification gate
    #[error("Worker {worker} is not verified (missing capabilities: {missing:?})")]
    NotVerified {
        worker: WorkerId,
        missing: Vec<String>,
    },

    // Communication bus
    #[error("Premature send from {from_stream} at phase {trigger_phase}: task {incomplete_task} is not completed")]
    PrematureSend {
        from_stream: String,
        trigger_phase: u32,
        incomplete_task: String,
    },

    #[error("Timed out after {timeout:?} waiting for a message from {from_stream} to {stream}")]
    MessageTimeout {
        stream: String,
        from_stream: String,
        timeout: Duration,
    },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    // Persistence
    #[error("Storage error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl OrchestratorError {
    /// Whether a caller may sensibly retry after observing this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Lost a claim race or raced a gate check; try the next candidate.
            Self::Conflict { .. } => true,
            // Recoverable once the worker declares its capabilities.
            Self::NotVerified { .. } => true,
            // Recoverable once the earlier phases complete.
            Self::PhaseBarrier { .. } => true,
            // Recoverable with backoff up to a bound.
            Self::MessageTimeout { .. } => true,
            Self::Database(_) => true,

            // Programmer or plan errors; retrying cannot help.
            Self::PlanValidation(_)
            | Self::PrematureSend { .. }
            | Self::UnknownDependency { .. }
            | Self::TaskNotFound { .. }
            | Self::StreamNotFound { .. }
            | Self::StreamAlreadyBound { .. }
            | Self::WorkerNotRegistered { .. }
            | Self::MessageNotFound { .. }
            | Self::Serialization(_) => false,
        }
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors_are_retryable() {
        let err = OrchestratorError::Conflict {
            task_id: "t1".to_string(),
            expected: TaskStatus::Pending,
            found: TaskStatus::InProgress,
        };
        assert!(err.is_retryable());
        let barrier = OrchestratorError::PhaseBarrier {
            task_id: "t2".to_string(),
            phase: 2,
        };
        assert!(barrier.is_retryable());
    }

    #[test]
    fn test_structural_errors_are_not_retryable() {
        assert!(!OrchestratorError::PlanValidation("cycle".to_string()).is_retryable());
        let premature = OrchestratorError::PrematureSend {
            from_stream: "s1".to_string(),
            trigger_phase: 1,
            incomplete_task: "t1".to_string(),
        };
        assert!(!premature.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::NotVerified {
            worker: "w-1".to_string(),
            missing: vec!["api-conventions".to_string()],
        };
        let display = err.to_string();
        assert!(display.contains("w-1"));
        assert!(display.contains("api-conventions"));
    }
}
