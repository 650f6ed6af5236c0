//! Workflow engine for agent coordination.
//!
//! A [`WorkflowDefinition`] is a set of [`Task`]s with dependencies. The
//! [`WorkflowEngine`] resolves a dependency order, runs each task on an agent
//! through a [`TaskExecutor`] and keeps a record of every run that can be
//! queried for state, metrics and debug info.

pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod local;
pub mod memory;
pub mod state;
pub mod task;

pub use engine::{EngineConfig, WorkflowEngine, WorkflowHandle, DEFAULT_EVENT_CAPACITY};
pub use error::WorkflowError;
pub use events::WorkflowEvent;
pub use executor::{AgentDescriptor, TaskExecutor, ANY_CAPABILITY};
pub use graph::{Dag, DependencyGraph, TaskGraph};
pub use local::{AgentMetrics, LocalExecutor, TaskAssignment};
pub use memory::{InMemorySink, MemoryEntry, MemoryKind, MemorySink};
pub use state::{
    EventLogEntry, TaskError, TaskTiming, TraceEntry, WorkflowDebugInfo, WorkflowMetrics,
    WorkflowResult, WorkflowState, WorkflowStatus,
};
pub use task::{
    RollbackHook, Task, TaskPriority, TaskResult, TaskStatus, WorkflowDefinition,
    WORKFLOW_TASK_TYPE,
};
