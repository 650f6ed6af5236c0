//! Audit trail sink for task execution.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryKind {
    TaskStart,
    TaskComplete,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    pub kind: MemoryKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Receives an entry when a task starts and when it finishes.
///
/// Errors are logged by the engine and never fail the task.
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> Result<()>;
}

/// Keeps entries in memory, in arrival order.
#[derive(Debug, Default)]
pub struct InMemorySink {
    entries: Mutex<Vec<MemoryEntry>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MemorySink for InMemorySink {
    async fn store(&self, entry: MemoryEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_sink_keeps_order() {
        let sink = InMemorySink::new();
        let records = [
            ("task-start-a", MemoryKind::TaskStart),
            ("task-complete-a", MemoryKind::TaskComplete),
        ];
        for (id, kind) in records {
            sink.store(MemoryEntry {
                id: id.to_string(),
                agent_id: "coder".to_string(),
                content: String::new(),
                kind,
                timestamp: Utc::now(),
                metadata: json!({}),
            })
            .await
            .unwrap();
        }

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, MemoryKind::TaskStart);
        assert_eq!(entries[1].id, "task-complete-a");
    }

    #[test]
    fn test_kind_serialization() {
        let value = serde_json::to_value(MemoryKind::TaskComplete).unwrap();
        assert_eq!(value, json!("task-complete"));
    }
}
