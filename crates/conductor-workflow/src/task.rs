//! Task and workflow definitions.
//!
//! A task is a unit of work executed by one agent, or a nested workflow run
//! as a single step of its parent.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Task type used for tasks that wrap a nested workflow.
pub const WORKFLOW_TASK_TYPE: &str = "workflow";

/// Task urgency. Used when distributing tasks across agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric rank; lower is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

/// Compensating action run when a workflow with `rollback_on_failure` fails
/// after this task completed.
#[derive(Clone)]
pub struct RollbackHook(Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl RollbackHook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    pub async fn run(&self) -> Result<()> {
        (self.0)().await
    }
}

impl std::fmt::Debug for RollbackHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RollbackHook")
    }
}

/// A unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier within its workflow
    pub id: String,
    /// Capability an agent needs to run this task
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Ids of tasks that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Pre-assigned agent; skips capability lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Nested workflow run in place of an agent execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Box<WorkflowDefinition>>,
    #[serde(skip)]
    pub on_rollback: Option<RollbackHook>,
}

impl Task {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: String::new(),
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            assigned_to: None,
            payload: serde_json::Value::Null,
            workflow: None,
            on_rollback: None,
        }
    }

    /// A task that runs `workflow` as a single step.
    pub fn nested(id: impl Into<String>, workflow: WorkflowDefinition) -> Self {
        let mut task = Self::new(id, WORKFLOW_TASK_TYPE);
        task.workflow = Some(Box::new(workflow));
        task
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn assigned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_to = Some(agent_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn on_rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_rollback = Some(RollbackHook::new(f));
        self
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow.is_some()
    }
}

/// Outcome of a single task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Completed => f.write_str("completed"),
            TaskStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Result reported by a task executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn completed(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: Some(agent_id.into()),
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        agent_id: Option<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// A named set of tasks with dependencies between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Stop at the first task failure and run rollback hooks of completed
    /// tasks. Off means best effort: failures are collected and the run
    /// continues.
    #[serde(default)]
    pub rollback_on_failure: bool,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
            rollback_on_failure: false,
        }
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}
