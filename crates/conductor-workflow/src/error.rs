//! Error type for workflow operations.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Workflow {0} not found")]
    NotFound(String),

    #[error("No agent available for task {task_id} (type '{task_type}')")]
    NoAgentAvailable { task_id: String, task_type: String },

    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Nested workflow failed in task {task_id}")]
    NestedWorkflowFailed { task_id: String },

    #[error("Circular dependencies detected among tasks: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Workflow cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Id of the task the error is about, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkflowError::NoAgentAvailable { task_id, .. }
            | WorkflowError::TaskFailed { task_id, .. }
            | WorkflowError::NestedWorkflowFailed { task_id }
            | WorkflowError::UnknownDependency { task_id, .. } => Some(task_id),
            WorkflowError::NotFound(_)
            | WorkflowError::CycleDetected(_)
            | WorkflowError::InvalidOperation(_)
            | WorkflowError::Cancelled => None,
        }
    }
}
