//! Task execution boundary.

use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability that lets an agent run tasks of any type.
pub const ANY_CAPABILITY: &str = "*";

/// An agent as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentDescriptor {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this agent declares the capability for `task_type`.
    pub fn can_execute(&self, task_type: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == task_type || c == ANY_CAPABILITY)
    }
}

/// Runs tasks on agents (to be implemented by the integration layer).
///
/// Failures are reported through [`TaskResult::status`], never as errors.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn list_agents(&self) -> Vec<AgentDescriptor>;

    async fn execute_task(&self, agent_id: &str, task: &Task) -> TaskResult;

    /// Run independent tasks concurrently, picking agents as the executor
    /// sees fit. No dependency ordering is applied.
    async fn execute_tasks_concurrently(&self, tasks: &[Task]) -> Vec<TaskResult>;
}
