use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique task identifier, assigned by the store at creation.
pub type TaskId = String;

/// Identity of a worker process, assigned when the worker is spawned.
pub type WorkerId = String;

/// Unique message identifier on the communication bus.
pub type MessageId = String;

/// Task lifecycle status.
///
/// `Blocked` means "waiting on dependencies"; a task that exhausted its
/// retries stays `Pending` with a `status_reason` set so the progress surface
/// can tell scheduling apart from breakage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// Atomic unit of work. Created by the coordinator during plan ingestion and
/// mutated only through `TaskStore` transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Owning stream; immutable after creation.
    pub stream: String,
    /// Barrier generation, 1-based; immutable after creation.
    pub phase: u32,
    pub status: TaskStatus,
    /// Set when the task is escalated for operator attention after retry
    /// exhaustion. A set reason excludes the task from `list_unblocked`.
    pub status_reason: Option<String>,
    pub description: String,
    /// Task ids that must reach `Completed` before this task is eligible.
    pub blocked_by: Vec<TaskId>,
    /// Worker holding the claim while `InProgress`.
    pub claimed_by: Option<WorkerId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Monotonic creation sequence, used for FIFO claim ordering.
    pub seq: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Task {
    pub fn needs_attention(&self) -> bool {
        self.status_reason.is_some()
    }
}

/// A named ownership domain over a disjoint set of resources, bound to
/// exactly one worker for the run's duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    /// Resource identifiers (e.g. paths) this stream owns exclusively.
    #[serde(default)]
    pub owned_resources: Vec<String>,
    /// Capability modules a worker must load before claiming tasks here.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Unit of cross-stream communication: an opaque description of an interface
/// or contract, never raw artifact content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from_stream: String,
    pub to_stream: String,
    /// The message may only be sent once every `from_stream` task in this
    /// phase is completed.
    pub trigger_phase: u32,
    pub payload: Value,
    pub delivered: bool,
    pub sent_at: NaiveDateTime,
}

/// One row of the read-only progress surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub id: TaskId,
    pub stream: String,
    pub phase: u32,
    pub status: TaskStatus,
    pub claimed_by: Option<WorkerId>,
    pub status_reason: Option<String>,
}

impl TaskProgress {
    /// True when the task is parked on a failure rather than a dependency.
    pub fn blocked_on_failure(&self) -> bool {
        self.status_reason.is_some()
    }

    /// True when the task is merely waiting for upstream work.
    pub fn blocked_on_dependency(&self) -> bool {
        self.status == TaskStatus::Blocked && self.status_reason.is_none()
    }
}

impl From<&Task> for TaskProgress {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            stream: task.stream.clone(),
            phase: task.phase,
            status: task.status,
            claimed_by: task.claimed_by.clone(),
            status_reason: task.status_reason.clone(),
        }
    }
}
