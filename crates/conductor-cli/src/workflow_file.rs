//! Loading workflow definitions from disk.

use anyhow::{bail, Context, Result};
use conductor_workflow::WorkflowDefinition;
use std::path::Path;

/// Read a workflow definition from a `.toml` or `.json` file.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let workflow: WorkflowDefinition = match extension.as_deref() {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML workflow in {}", path.display()))?,
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("Invalid JSON workflow in {}", path.display()))?,
        _ => bail!(
            "Unsupported workflow file {}: expected .toml or .json",
            path.display()
        ),
    };

    if workflow.tasks.is_empty() {
        bail!("Workflow {} has no tasks", workflow.id);
    }
    Ok(workflow)
}
