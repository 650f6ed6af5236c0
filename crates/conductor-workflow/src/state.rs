//! Workflow run state and the views derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    InProgress,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether the run has finished or been stopped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Cancelled | WorkflowStatus::Completed | WorkflowStatus::Failed
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::InProgress => "in-progress",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    /// Top-level task ids, in declaration order
    pub tasks: Vec<String>,
    /// Completed task ids, in completion order
    pub completed_tasks: Vec<String>,
    pub current_task: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Wall-clock timing of one successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub total_duration_ms: u64,
    pub average_task_duration_ms: f64,
    /// `tasks_completed / tasks_total`, zero for an empty workflow
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDebugInfo {
    pub execution_trace: Vec<TraceEntry>,
    pub task_timings: BTreeMap<String, TaskTiming>,
    pub event_log: Vec<EventLogEntry>,
}

/// A failure collected during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// `None` when the failure is not tied to a task, e.g. a dependency cycle.
    pub task_id: Option<String>,
    pub message: String,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_id {
            Some(id) => write!(f, "{}: {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Final outcome of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub id: String,
    pub status: WorkflowStatus,
    pub tasks_completed: usize,
    pub errors: Vec<TaskError>,
    /// Completed task ids, in completion order
    pub execution_order: Vec<String>,
    pub duration_ms: u64,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Everything the engine records about one run.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionRecord {
    pub(crate) state: WorkflowState,
    pub(crate) task_timings: BTreeMap<String, TaskTiming>,
    pub(crate) event_log: Vec<EventLogEntry>,
}

impl ExecutionRecord {
    pub(crate) fn new(id: &str, name: &str, tasks: Vec<String>) -> Self {
        Self {
            state: WorkflowState {
                id: id.to_string(),
                name: name.to_string(),
                status: WorkflowStatus::InProgress,
                tasks,
                completed_tasks: Vec::new(),
                current_task: None,
                started_at: Utc::now(),
                completed_at: None,
            },
            task_timings: BTreeMap::new(),
            event_log: Vec::new(),
        }
    }

    pub(crate) fn log(&mut self, event: &str, data: serde_json::Value) {
        self.event_log.push(EventLogEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            data,
        });
    }

    pub(crate) fn start_task(&mut self, task_id: &str) {
        self.state.current_task = Some(task_id.to_string());
    }

    pub(crate) fn complete_task(&mut self, task_id: &str, timing: TaskTiming) {
        self.state.completed_tasks.push(task_id.to_string());
        self.state.current_task = None;
        self.task_timings.insert(task_id.to_string(), timing);
    }

    pub(crate) fn fail_task(&mut self, task_id: &str, error: &str) {
        self.state.current_task = None;
        self.log(
            "task:failed",
            serde_json::json!({ "taskId": task_id, "error": error }),
        );
    }

    pub(crate) fn finish(&mut self, status: WorkflowStatus) {
        self.state.status = status;
        self.state.current_task = None;
        self.state.completed_at = Some(Utc::now());
    }

    pub(crate) fn metrics(&self) -> WorkflowMetrics {
        let tasks_total = self.state.tasks.len();
        let tasks_completed = self.state.completed_tasks.len();
        let total_duration_ms: u64 = self.task_timings.values().map(|t| t.duration_ms).sum();
        let average_task_duration_ms = if self.task_timings.is_empty() {
            0.0
        } else {
            total_duration_ms as f64 / self.task_timings.len() as f64
        };
        let success_rate = if tasks_total > 0 {
            tasks_completed as f64 / tasks_total as f64
        } else {
            0.0
        };

        WorkflowMetrics {
            tasks_total,
            tasks_completed,
            total_duration_ms,
            average_task_duration_ms,
            success_rate,
        }
    }

    pub(crate) fn debug_info(&self) -> WorkflowDebugInfo {
        let execution_trace = self
            .state
            .completed_tasks
            .iter()
            .map(|task_id| TraceEntry {
                task_id: task_id.clone(),
                timestamp: self
                    .task_timings
                    .get(task_id)
                    .map(|t| t.started_at)
                    .unwrap_or_else(Utc::now),
                action: "execute".to_string(),
            })
            .collect();

        WorkflowDebugInfo {
            execution_trace,
            task_timings: self.task_timings.clone(),
            event_log: self.event_log.clone(),
        }
    }
}
