//! Dependency resolution for workflow tasks.
//!
//! Provides:
//! - Topological ordering that keeps declaration order among ready tasks
//! - Circular and unknown dependency detection
//! - Execution levels (tasks in one level have no ordering between them)

use crate::error::WorkflowError;
use crate::task::Task;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Orders tasks so every task comes after its dependencies.
pub trait TaskGraph: Send + Sync {
    fn resolve_execution_order(&self, tasks: &[Task]) -> Result<Vec<Task>, WorkflowError>;
}

/// A node in the DAG with its dependencies, by declaration index.
#[derive(Debug, Clone)]
struct DagNode {
    id: String,
    dependencies: BTreeSet<usize>,
    dependents: BTreeSet<usize>,
}

/// DAG over a task list.
#[derive(Debug)]
pub struct Dag {
    nodes: Vec<DagNode>,
}

impl Dag {
    /// Build a DAG from tasks, rejecting duplicate ids and unknown
    /// dependencies. Cycles are detected by [`Dag::topological_order`].
    pub fn from_tasks(tasks: &[Task]) -> Result<Self, WorkflowError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(WorkflowError::InvalidOperation(format!(
                    "Duplicate task id: {}",
                    task.id
                )));
            }
        }

        let mut nodes: Vec<DagNode> = tasks
            .iter()
            .map(|task| DagNode {
                id: task.id.clone(),
                dependencies: BTreeSet::new(),
                dependents: BTreeSet::new(),
            })
            .collect();

        for (i, task) in tasks.iter().enumerate() {
            for dependency in &task.dependencies {
                let dep = *index.get(dependency.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                nodes[i].dependencies.insert(dep);
                nodes[dep].dependents.insert(i);
            }
        }

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Kahn's algorithm; among ready tasks the lowest declaration index goes
    /// first. Returns declaration indices.
    pub fn topological_order(&self) -> Result<Vec<usize>, WorkflowError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &dependent in &self.nodes[i].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let remaining: Vec<String> = self
                .nodes
                .iter()
                .zip(&in_degree)
                .filter(|(_, degree)| **degree > 0)
                .map(|(node, _)| node.id.clone())
                .collect();
            return Err(WorkflowError::CycleDetected(remaining));
        }

        Ok(order)
    }

    /// Group task ids into levels; every task's dependencies sit in earlier
    /// levels.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, WorkflowError> {
        let order = self.topological_order()?;
        let mut depth = vec![0usize; self.nodes.len()];
        for &i in &order {
            depth[i] = self.nodes[i]
                .dependencies
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let level = depth[i];
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node.id.clone());
        }
        Ok(levels)
    }
}

/// Default [`TaskGraph`]: a stable topological sort over declared
/// dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyGraph;

impl DependencyGraph {
    pub fn new() -> Self {
        Self
    }

    /// Dependency levels of `tasks`, declaration order within a level.
    pub fn execution_levels(&self, tasks: &[Task]) -> Result<Vec<Vec<String>>, WorkflowError> {
        Dag::from_tasks(tasks)?.execution_levels()
    }
}

impl TaskGraph for DependencyGraph {
    fn resolve_execution_order(&self, tasks: &[Task]) -> Result<Vec<Task>, WorkflowError> {
        let dag = Dag::from_tasks(tasks)?;
        let order = dag.topological_order()?;
        debug!("Resolved execution order for {} tasks", order.len());
        Ok(order.into_iter().map(|i| tasks[i].clone()).collect())
    }
}
