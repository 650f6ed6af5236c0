//! In-process task executor.
//!
//! Runs tasks against a fixed pool of simulated agents. A task payload may
//! steer the outcome:
//! - `"delay_ms": <n>` sleeps before finishing
//! - `"fail": <message>` reports a failure with that message
//!
//! Concurrent batches are load balanced: tasks are taken most urgent first and
//! each goes to the capable agent with the fewest assignments so far.

use crate::executor::{AgentDescriptor, TaskExecutor};
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-agent execution counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_execution_ms: f64,
    pub success_rate: f64,
}

impl AgentMetrics {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            tasks_completed: 0,
            tasks_failed: 0,
            average_execution_ms: 0.0,
            success_rate: 1.0,
        }
    }

    fn record(&mut self, success: bool, duration_ms: u64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = (self.tasks_completed + self.tasks_failed) as f64;
        self.success_rate = self.tasks_completed as f64 / total;
        self.average_execution_ms =
            (self.average_execution_ms * (total - 1.0) + duration_ms as f64) / total;
    }
}

/// A task paired with the agent chosen to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub agent_id: String,
}

pub struct LocalExecutor {
    agents: Vec<AgentDescriptor>,
    metrics: Mutex<HashMap<String, AgentMetrics>>,
}

impl LocalExecutor {
    pub fn new(agents: Vec<AgentDescriptor>) -> Self {
        let metrics = agents
            .iter()
            .map(|a| (a.id.clone(), AgentMetrics::new(&a.id)))
            .collect();
        Self {
            agents,
            metrics: Mutex::new(metrics),
        }
    }

    pub fn with_agent(mut self, agent: AgentDescriptor) -> Self {
        self.metrics
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.id.clone(), AgentMetrics::new(&agent.id));
        self.agents.push(agent);
        self
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    /// Assign each task to the least-loaded capable agent, most urgent tasks
    /// first. Tasks no agent can run are left out.
    pub fn distribute(&self, tasks: &[Task]) -> Vec<TaskAssignment> {
        let mut loads: HashMap<&str, usize> =
            self.agents.iter().map(|a| (a.id.as_str(), 0)).collect();

        let mut sorted: Vec<&Task> = tasks.iter().collect();
        sorted.sort_by_key(|t| t.priority.rank());

        let mut assignments = Vec::new();
        for task in sorted {
            let best = self
                .agents
                .iter()
                .filter(|a| a.can_execute(&task.task_type))
                .min_by_key(|a| loads.get(a.id.as_str()).copied().unwrap_or(0));

            if let Some(agent) = best {
                *loads.entry(agent.id.as_str()).or_insert(0) += 1;
                assignments.push(TaskAssignment {
                    task_id: task.id.clone(),
                    agent_id: agent.id.clone(),
                });
            }
        }
        assignments
    }

    fn record(&self, agent_id: &str, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = metrics.get_mut(agent_id) {
            entry.record(success, duration_ms);
        }
    }
}

#[async_trait]
impl TaskExecutor for LocalExecutor {
    async fn list_agents(&self) -> Vec<AgentDescriptor> {
        self.agents.clone()
    }

    async fn execute_task(&self, agent_id: &str, task: &Task) -> TaskResult {
        let Some(agent) = self.agents.iter().find(|a| a.id == agent_id) else {
            return TaskResult::failed(
                &task.id,
                Some(agent_id.to_string()),
                format!("Agent {} not found", agent_id),
                0,
            );
        };

        if !agent.can_execute(&task.task_type) {
            return TaskResult::failed(
                &task.id,
                Some(agent_id.to_string()),
                format!("Agent {} cannot execute task type '{}'", agent_id, task.task_type),
                0,
            );
        }

        debug!("Agent {} executing task {}", agent_id, task.id);
        let start = Instant::now();

        if let Some(delay) = task.payload.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failure = task.payload.get("fail").map(|reason| match reason.as_str() {
            Some(message) => message.to_string(),
            None => reason.to_string(),
        });

        let duration_ms = start.elapsed().as_millis() as u64;
        self.record(agent_id, failure.is_none(), duration_ms);

        match failure {
            Some(message) => {
                TaskResult::failed(&task.id, Some(agent_id.to_string()), message, duration_ms)
            }
            None => TaskResult::completed(
                &task.id,
                agent_id,
                json!({ "task": task.id, "agent": agent_id }),
                duration_ms,
            ),
        }
    }

    async fn execute_tasks_concurrently(&self, tasks: &[Task]) -> Vec<TaskResult> {
        let assignments = self.distribute(tasks);

        let runs = tasks.iter().map(|task| {
            let agent = assignments
                .iter()
                .find(|a| a.task_id == task.id)
                .map(|a| a.agent_id.clone());
            async move {
                match agent {
                    Some(agent_id) => self.execute_task(&agent_id, task).await,
                    None => TaskResult::failed(
                        &task.id,
                        None,
                        format!("No agent available for task {}", task.id),
                        0,
                    ),
                }
            }
        });

        join_all(runs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskPriority, TaskStatus};

    fn executor() -> LocalExecutor {
        LocalExecutor::new(vec![
            AgentDescriptor::new("coder-1", ["code"]),
            AgentDescriptor::new("coder-2", ["code"]),
            AgentDescriptor::new("tester", ["test"]),
        ])
    }

    #[tokio::test]
    async fn test_execute_success() {
        let exec = executor();
        let result = exec.execute_task("coder-1", &Task::new("a", "code")).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.agent_id.as_deref(), Some("coder-1"));
        assert_eq!(exec.agent_metrics("coder-1").unwrap().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_payload_failure() {
        let exec = executor();
        let task = Task::new("a", "code").with_payload(json!({"fail": "compiler exploded"}));

        let result = exec.execute_task("coder-1", &task).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("compiler exploded"));

        let metrics = exec.agent_metrics("coder-1").unwrap();
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_and_incapable_agents() {
        let exec = executor();

        let result = exec.execute_task("ghost", &Task::new("a", "code")).await;
        assert_eq!(result.error.as_deref(), Some("Agent ghost not found"));

        let result = exec.execute_task("tester", &Task::new("a", "code")).await;
        assert!(!result.is_success());
    }

    #[test]
    fn test_distribute_balances_load() {
        let exec = executor();
        let tasks = vec![
            Task::new("a", "code"),
            Task::new("b", "code"),
            Task::new("c", "test"),
            Task::new("d", "deploy"),
        ];

        let assignments = exec.distribute(&tasks);
        assert_eq!(assignments.len(), 3);
        assert_eq!(assignments[0].agent_id, "coder-1");
        assert_eq!(assignments[1].agent_id, "coder-2");
        assert_eq!(assignments[2].agent_id, "tester");
    }

    #[test]
    fn test_distribute_urgent_first() {
        let exec = executor();
        let tasks = vec![
            Task::new("low", "code").with_priority(TaskPriority::Low),
            Task::new("urgent", "code").with_priority(TaskPriority::Critical),
        ];

        let assignments = exec.distribute(&tasks);
        assert_eq!(assignments[0].task_id, "urgent");
        assert_eq!(assignments[0].agent_id, "coder-1");
    }

    #[tokio::test]
    async fn test_concurrent_results_follow_input_order() {
        let exec = executor();
        let tasks = vec![
            Task::new("slow", "code").with_payload(json!({"delay_ms": 30})),
            Task::new("fast", "test"),
            Task::new("orphan", "deploy"),
        ];

        let results = exec.execute_tasks_concurrently(&tasks).await;
        let ids: Vec<_> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fast", "orphan"]);
        assert!(results[0].is_success());
        assert!(results[1].is_success());
        assert!(!results[2].is_success());
    }
}
