//! Workflow lifecycle notifications.

use crate::state::{TaskError, WorkflowResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        workflow_id: String,
        task_count: usize,
    },
    TaskComplete {
        workflow_id: String,
        task_id: String,
    },
    Completed {
        workflow_id: String,
        result: WorkflowResult,
    },
    Failed {
        workflow_id: String,
        errors: Vec<TaskError>,
    },
    Paused {
        workflow_id: String,
    },
    Resumed {
        workflow_id: String,
    },
    Cancelled {
        workflow_id: String,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Started { .. } => "workflow:started",
            WorkflowEvent::TaskComplete { .. } => "workflow:taskComplete",
            WorkflowEvent::Completed { .. } => "workflow:completed",
            WorkflowEvent::Failed { .. } => "workflow:failed",
            WorkflowEvent::Paused { .. } => "workflow:paused",
            WorkflowEvent::Resumed { .. } => "workflow:resumed",
            WorkflowEvent::Cancelled { .. } => "workflow:cancelled",
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::Started { workflow_id, .. }
            | WorkflowEvent::TaskComplete { workflow_id, .. }
            | WorkflowEvent::Completed { workflow_id, .. }
            | WorkflowEvent::Failed { workflow_id, .. }
            | WorkflowEvent::Paused { workflow_id }
            | WorkflowEvent::Resumed { workflow_id }
            | WorkflowEvent::Cancelled { workflow_id } => workflow_id,
        }
    }
}
