// Core data types and errors
pub mod error;
pub mod model;

// Plan ingestion and persistence
pub mod plan;
pub mod storage;

// Scheduling: the task store and the pure dependency/phase resolution over it
pub mod resolver;
pub mod store;

// Stream ownership, admission control, and cross-stream handoffs
pub mod bus;
pub mod gate;
pub mod registry;

// Execution: per-stream workers under one coordinator
pub mod coordinator;
pub mod worker;

// Re-exports for convenience
pub use bus::CommunicationBus;
pub use coordinator::{CompletionSignal, Coordinator, CoordinatorConfig, RunReport};
pub use error::{OrchestratorError, Result};
pub use gate::VerificationGate;
pub use model::{Message, StreamSpec, Task, TaskProgress, TaskStatus};
pub use plan::{ChunkSpec, CommunicationRule, ExecutionPlan, PhaseSpec};
pub use registry::StreamRegistry;
pub use storage::{SledStorage, Storage};
pub use store::TaskStore;
pub use worker::{HandlerContext, TaskHandler, Worker, WorkerReport};
