//! Workflow engine.
//!
//! Runs workflow definitions task by task in dependency order. A run can be
//! paused, resumed and cancelled between tasks; cancellation never interrupts
//! a task that is already executing. With `rollback_on_failure` the first
//! failure stops the run and the rollback hooks of completed tasks run in
//! reverse completion order.

use crate::error::WorkflowError;
use crate::events::WorkflowEvent;
use crate::executor::TaskExecutor;
use crate::graph::{DependencyGraph, TaskGraph};
use crate::memory::{MemoryEntry, MemoryKind, MemorySink};
use crate::state::{
    ExecutionRecord, TaskError, TaskTiming, WorkflowDebugInfo, WorkflowMetrics, WorkflowResult,
    WorkflowState, WorkflowStatus,
};
use crate::task::{Task, TaskResult, TaskStatus, WorkflowDefinition};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Default buffer of the engine event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Buffer size of the observer event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize { DEFAULT_EVENT_CAPACITY }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

type ResultSender = watch::Sender<Option<WorkflowResult>>;
type ResultReceiver = watch::Receiver<Option<WorkflowResult>>;

struct Run {
    record: ExecutionRecord,
    /// Drives pause, resume and cancel in the running task loop.
    control: watch::Sender<WorkflowStatus>,
    result: ResultReceiver,
}

impl Run {
    /// Whether the task loop still owns this record. A run whose loop went
    /// away without publishing a result is not running either.
    fn is_running(&self) -> bool {
        let finished = self.result.borrow().is_some();
        !finished && self.result.has_changed().is_ok()
    }
}

/// Handle to a workflow running in the background.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    result: ResultReceiver,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Wait for the run to finish.
    pub async fn wait(mut self) -> Result<WorkflowResult, WorkflowError> {
        wait_result(&mut self.result).await
    }
}

async fn wait_result(result: &mut ResultReceiver) -> Result<WorkflowResult, WorkflowError> {
    let finished = result
        .wait_for(Option::is_some)
        .await
        .map_err(|_| WorkflowError::InvalidOperation("workflow run ended without a result".into()))?;
    (*finished)
        .clone()
        .ok_or_else(|| WorkflowError::InvalidOperation("workflow run ended without a result".into()))
}

/// Wait out a pause. Returns the status that ended the wait.
async fn wait_until_runnable(control: &mut watch::Receiver<WorkflowStatus>) -> WorkflowStatus {
    match control.wait_for(|status| *status != WorkflowStatus::Paused).await {
        Ok(status) => *status,
        Err(_) => WorkflowStatus::Cancelled,
    }
}

/// Executes workflows against a [`TaskExecutor`].
///
/// Cheap to clone; clones share the same run records.
#[derive(Clone)]
pub struct WorkflowEngine {
    executor: Arc<dyn TaskExecutor>,
    graph: Arc<dyn TaskGraph>,
    memory: Option<Arc<dyn MemorySink>>,
    runs: Arc<Mutex<HashMap<String, Run>>>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_config(executor, EngineConfig::default())
    }

    pub fn with_config(executor: Arc<dyn TaskExecutor>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            executor,
            graph: Arc::new(DependencyGraph),
            memory: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Replace the default dependency resolver.
    pub fn with_graph(mut self, graph: Arc<dyn TaskGraph>) -> Self {
        self.graph = graph;
        self
    }

    /// Record task start and completion in `memory`.
    pub fn with_memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Run a workflow to completion.
    ///
    /// Fails without touching any record when a run with the same id is
    /// still in progress.
    pub async fn execute_workflow(&self, workflow: WorkflowDefinition) -> WorkflowResult {
        match self.register(&workflow) {
            Ok((control, result_tx, _)) => self.run(workflow, control, result_tx).await,
            Err(e) => {
                warn!("Refusing to run workflow {}: {}", workflow.id, e);
                WorkflowResult {
                    id: workflow.id,
                    status: WorkflowStatus::Failed,
                    tasks_completed: 0,
                    errors: vec![TaskError {
                        task_id: None,
                        message: e.to_string(),
                    }],
                    execution_order: Vec::new(),
                    duration_ms: 0,
                }
            }
        }
    }

    /// Start a workflow in the background.
    ///
    /// The run is registered before this returns, so its state can be
    /// queried, paused or cancelled right away. Returns
    /// [`WorkflowError::InvalidOperation`] while a run with the same id is
    /// still in progress.
    pub fn start_workflow(
        &self,
        workflow: WorkflowDefinition,
    ) -> Result<WorkflowHandle, WorkflowError> {
        let (control, result_tx, result_rx) = self.register(&workflow)?;
        let workflow_id = workflow.id.clone();

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(workflow, control, result_tx).await;
        });

        Ok(WorkflowHandle {
            workflow_id,
            result: result_rx,
        })
    }

    /// Wait for a registered run to finish.
    pub async fn wait_for(&self, workflow_id: &str) -> Result<WorkflowResult, WorkflowError> {
        let mut result = {
            let runs = self.runs();
            runs.get(workflow_id)
                .map(|run| run.result.clone())
                .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?
        };
        wait_result(&mut result).await
    }

    /// `InProgress -> Paused`; a no-op from any other status.
    pub fn pause_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        if self.transition(workflow_id, &[WorkflowStatus::InProgress], WorkflowStatus::Paused)? {
            info!("Workflow {} paused", workflow_id);
            self.emit(WorkflowEvent::Paused {
                workflow_id: workflow_id.to_string(),
            });
        }
        Ok(())
    }

    /// `Paused -> InProgress`; a no-op from any other status.
    pub fn resume_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        if self.transition(workflow_id, &[WorkflowStatus::Paused], WorkflowStatus::InProgress)? {
            info!("Workflow {} resumed", workflow_id);
            self.emit(WorkflowEvent::Resumed {
                workflow_id: workflow_id.to_string(),
            });
        }
        Ok(())
    }

    /// Stop a running or paused workflow before its next task.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        let from = [WorkflowStatus::InProgress, WorkflowStatus::Paused];
        if self.transition(workflow_id, &from, WorkflowStatus::Cancelled)? {
            info!("Workflow {} cancelled", workflow_id);
            self.emit(WorkflowEvent::Cancelled {
                workflow_id: workflow_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_workflow_state(&self, workflow_id: &str) -> Result<WorkflowState, WorkflowError> {
        self.inspect(workflow_id, |record| record.state.clone())
    }

    pub fn get_workflow_metrics(&self, workflow_id: &str) -> Result<WorkflowMetrics, WorkflowError> {
        self.inspect(workflow_id, ExecutionRecord::metrics)
    }

    pub fn get_workflow_debug_info(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowDebugInfo, WorkflowError> {
        self.inspect(workflow_id, ExecutionRecord::debug_info)
    }

    /// Ids of all registered runs, sorted.
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run independent tasks concurrently on the executor. No dependency
    /// ordering is applied.
    pub async fn execute_parallel(&self, tasks: &[Task]) -> Vec<TaskResult> {
        self.executor.execute_tasks_concurrently(tasks).await
    }

    /// Spread a workflow's tasks over several executors.
    ///
    /// Tasks are split into contiguous chunks of `ceil(n / executors)`; chunk
    /// `i` runs on executor `i % executors`, all chunks concurrently. Within a
    /// chunk tasks run one after another on the executor's first agent.
    /// Dependencies are not consulted.
    pub async fn execute_distributed_workflow(
        &self,
        workflow: &WorkflowDefinition,
        executors: &[Arc<dyn TaskExecutor>],
    ) -> Result<WorkflowResult, WorkflowError> {
        if executors.is_empty() {
            return Err(WorkflowError::InvalidOperation(
                "distributed execution needs at least one executor".into(),
            ));
        }

        let clock = Instant::now();
        let chunk_size = workflow.tasks.len().div_ceil(executors.len()).max(1);
        info!(
            "Distributing workflow {} ({} tasks) over {} executors, {} tasks per chunk",
            workflow.id,
            workflow.tasks.len(),
            executors.len(),
            chunk_size
        );

        let chunks = workflow
            .tasks
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let executor = executors[index % executors.len()].clone();
                async move {
                    let agents = executor.list_agents().await;
                    let mut results = Vec::with_capacity(chunk.len());
                    for task in chunk {
                        let result = match agents.first() {
                            Some(agent) => executor.execute_task(&agent.id, task).await,
                            None => {
                                let error = WorkflowError::NoAgentAvailable {
                                    task_id: task.id.clone(),
                                    task_type: task.task_type.clone(),
                                };
                                TaskResult::failed(&task.id, None, error.to_string(), 0)
                            }
                        };
                        results.push(result);
                    }
                    results
                }
            });

        let results: Vec<TaskResult> = join_all(chunks).await.into_iter().flatten().collect();

        let execution_order: Vec<String> = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.task_id.clone())
            .collect();
        let errors: Vec<TaskError> = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| TaskError {
                task_id: Some(r.task_id.clone()),
                message: r.error.clone().unwrap_or_else(|| "Task failed".to_string()),
            })
            .collect();

        let status = if errors.is_empty() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        info!(
            "Distributed workflow {} {}: {}/{} tasks completed",
            workflow.id,
            status,
            execution_order.len(),
            workflow.tasks.len()
        );

        Ok(WorkflowResult {
            id: workflow.id.clone(),
            status,
            tasks_completed: execution_order.len(),
            errors,
            execution_order,
            duration_ms: clock.elapsed().as_millis() as u64,
        })
    }

    /// Execute one task on an agent, recording start and completion in the
    /// memory sink.
    pub async fn execute_task(&self, task: &Task, agent_id: &str) -> TaskResult {
        self.remember(MemoryEntry {
            id: format!("task-start-{}", task.id),
            agent_id: agent_id.to_string(),
            content: format!("Task {} started", task.id),
            kind: MemoryKind::TaskStart,
            timestamp: Utc::now(),
            metadata: json!({ "taskId": task.id, "agentId": agent_id }),
        })
        .await;

        let result = self.executor.execute_task(agent_id, task).await;

        self.remember(MemoryEntry {
            id: format!("task-complete-{}", task.id),
            agent_id: agent_id.to_string(),
            content: format!("Task {} {}", task.id, result.status),
            kind: MemoryKind::TaskComplete,
            timestamp: Utc::now(),
            metadata: json!({
                "taskId": task.id,
                "agentId": agent_id,
                "status": result.status,
                "duration": result.duration_ms,
            }),
        })
        .await;

        result
    }

    /// Cancel every in-progress or paused run and forget all records.
    pub fn shutdown(&self) {
        let mut runs = self.runs();
        let mut cancelled = 0;
        for run in runs.values_mut() {
            if !run.record.state.status.is_terminal() {
                run.record.state.status = WorkflowStatus::Cancelled;
                run.control.send_replace(WorkflowStatus::Cancelled);
                cancelled += 1;
            }
        }
        runs.clear();
        info!("Workflow engine shut down ({} runs cancelled)", cancelled);
    }

    // --- internal ---

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Run>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    fn register(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<(watch::Receiver<WorkflowStatus>, ResultSender, ResultReceiver), WorkflowError> {
        let mut runs = self.runs();
        if let Some(existing) = runs.get(&workflow.id) {
            if existing.is_running() {
                return Err(WorkflowError::InvalidOperation(format!(
                    "workflow {} is already running",
                    workflow.id
                )));
            }
            debug!("Replacing finished record of workflow {}", workflow.id);
        }

        let task_ids = workflow.tasks.iter().map(|t| t.id.clone()).collect();
        let record = ExecutionRecord::new(&workflow.id, &workflow.name, task_ids);
        let (control_tx, control_rx) = watch::channel(WorkflowStatus::InProgress);
        let (result_tx, result_rx) = watch::channel(None);

        runs.insert(
            workflow.id.clone(),
            Run {
                record,
                control: control_tx,
                result: result_rx.clone(),
            },
        );

        Ok((control_rx, result_tx, result_rx))
    }

    fn update<R>(&self, workflow_id: &str, f: impl FnOnce(&mut ExecutionRecord) -> R) -> Option<R> {
        self.runs().get_mut(workflow_id).map(|run| f(&mut run.record))
    }

    fn inspect<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&ExecutionRecord) -> R,
    ) -> Result<R, WorkflowError> {
        self.runs()
            .get(workflow_id)
            .map(|run| f(&run.record))
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    /// Move a run to `to` if it is currently in one of `from`. Returns whether
    /// the transition happened.
    fn transition(
        &self,
        workflow_id: &str,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> Result<bool, WorkflowError> {
        let mut runs = self.runs();
        let run = runs
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;

        let current = run.record.state.status;
        if !from.contains(&current) {
            debug!("Workflow {} is {}; ignoring move to {}", workflow_id, current, to);
            return Ok(false);
        }

        run.record.state.status = to;
        run.control.send_replace(to);
        let event = match to {
            WorkflowStatus::Paused => "workflow:paused",
            WorkflowStatus::InProgress => "workflow:resumed",
            WorkflowStatus::Cancelled => "workflow:cancelled",
            WorkflowStatus::Completed => "workflow:completed",
            WorkflowStatus::Failed => "workflow:failed",
        };
        run.record.log(event, json!({ "workflowId": workflow_id }));
        Ok(true)
    }

    fn execute_nested(&self, workflow: WorkflowDefinition) -> BoxFuture<'static, WorkflowResult> {
        let engine = self.clone();
        async move { engine.execute_workflow(workflow).await }.boxed()
    }

    async fn run(
        &self,
        workflow: WorkflowDefinition,
        mut control: watch::Receiver<WorkflowStatus>,
        result_tx: ResultSender,
    ) -> WorkflowResult {
        let clock = Instant::now();
        info!(
            "Starting workflow '{}' ({}) with {} tasks",
            workflow.name,
            workflow.id,
            workflow.tasks.len()
        );
        self.update(&workflow.id, |record| {
            record.log("workflow:started", json!({ "workflowId": workflow.id }))
        });
        self.emit(WorkflowEvent::Started {
            workflow_id: workflow.id.clone(),
            task_count: workflow.tasks.len(),
        });

        let mut errors: Vec<TaskError> = Vec::new();
        let mut completed: Vec<Task> = Vec::new();
        let mut cancelled = false;

        match self.graph.resolve_execution_order(&workflow.tasks) {
            Ok(ordered) => {
                for task in ordered {
                    if wait_until_runnable(&mut control).await == WorkflowStatus::Cancelled {
                        cancelled = true;
                        break;
                    }

                    self.update(&workflow.id, |record| record.start_task(&task.id));
                    let started_at = Utc::now();
                    let task_clock = Instant::now();

                    match self.run_task(&task).await {
                        Ok(()) => {
                            let duration_ms = task_clock.elapsed().as_millis() as u64;
                            let timing = TaskTiming {
                                started_at,
                                ended_at: Utc::now(),
                                duration_ms,
                            };
                            self.update(&workflow.id, |record| {
                                record.complete_task(&task.id, timing);
                                record.log(
                                    "task:completed",
                                    json!({ "taskId": task.id, "duration": duration_ms }),
                                );
                            });
                            debug!("Task {} completed in {}ms", task.id, duration_ms);
                            self.emit(WorkflowEvent::TaskComplete {
                                workflow_id: workflow.id.clone(),
                                task_id: task.id.clone(),
                            });
                            completed.push(task);
                        }
                        Err(e) => {
                            let message = e.to_string();
                            warn!("Task {} in workflow {} failed: {}", task.id, workflow.id, message);
                            self.update(&workflow.id, |record| record.fail_task(&task.id, &message));
                            errors.push(TaskError {
                                task_id: Some(task.id.clone()),
                                message,
                            });
                            if workflow.rollback_on_failure {
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Cannot order tasks of workflow {}: {}", workflow.id, e);
                errors.push(TaskError {
                    task_id: e.task_id().map(str::to_string),
                    message: e.to_string(),
                });
            }
        }

        // A cancel accepted while the last task ran never reaches a boundary.
        let cancelled = cancelled || *control.borrow() == WorkflowStatus::Cancelled;
        let status = if !errors.is_empty() {
            WorkflowStatus::Failed
        } else if cancelled {
            WorkflowStatus::Cancelled
        } else {
            WorkflowStatus::Completed
        };

        if status == WorkflowStatus::Failed && workflow.rollback_on_failure {
            self.rollback(&workflow.id, &completed).await;
        }

        self.update(&workflow.id, |record| record.finish(status));

        let execution_order: Vec<String> = completed.iter().map(|t| t.id.clone()).collect();
        let result = WorkflowResult {
            id: workflow.id.clone(),
            status,
            tasks_completed: execution_order.len(),
            errors,
            execution_order,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        match status {
            WorkflowStatus::Completed => {
                info!(
                    "Workflow {} completed: {} tasks in {}ms",
                    workflow.id, result.tasks_completed, result.duration_ms
                );
                self.update(&workflow.id, |record| {
                    record.log("workflow:completed", json!({ "workflowId": workflow.id }))
                });
                self.emit(WorkflowEvent::Completed {
                    workflow_id: workflow.id.clone(),
                    result: result.clone(),
                });
            }
            WorkflowStatus::Failed => {
                warn!(
                    "Workflow {} failed with {} error(s) after {} completed tasks",
                    workflow.id,
                    result.errors.len(),
                    result.tasks_completed
                );
                self.update(&workflow.id, |record| {
                    record.log(
                        "workflow:failed",
                        json!({ "workflowId": workflow.id, "errors": result.errors.len() }),
                    )
                });
                self.emit(WorkflowEvent::Failed {
                    workflow_id: workflow.id.clone(),
                    errors: result.errors.clone(),
                });
            }
            WorkflowStatus::Cancelled => {
                info!(
                    "Workflow {} stopped after {} completed tasks",
                    workflow.id, result.tasks_completed
                );
            }
            WorkflowStatus::InProgress | WorkflowStatus::Paused => {}
        }

        result_tx.send_replace(Some(result.clone()));
        result
    }

    async fn run_task(&self, task: &Task) -> Result<(), WorkflowError> {
        if let Some(nested) = &task.workflow {
            debug!("Task {} runs nested workflow {}", task.id, nested.id);
            let result = self.execute_nested(nested.as_ref().clone()).await;
            if result.status != WorkflowStatus::Completed {
                return Err(WorkflowError::NestedWorkflowFailed {
                    task_id: task.id.clone(),
                });
            }
            return Ok(());
        }

        let agent_id = match &task.assigned_to {
            Some(agent_id) => agent_id.clone(),
            None => self
                .executor
                .list_agents()
                .await
                .into_iter()
                .find(|agent| agent.can_execute(&task.task_type))
                .map(|agent| agent.id)
                .ok_or_else(|| WorkflowError::NoAgentAvailable {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                })?,
        };

        let result = self.execute_task(task, &agent_id).await;
        match result.status {
            TaskStatus::Completed => Ok(()),
            TaskStatus::Failed => Err(WorkflowError::TaskFailed {
                task_id: task.id.clone(),
                message: result
                    .error
                    .unwrap_or_else(|| "Task execution failed".to_string()),
            }),
        }
    }

    /// Run rollback hooks of `completed` tasks, newest first. Hook failures
    /// are logged and the sweep continues.
    async fn rollback(&self, workflow_id: &str, completed: &[Task]) {
        info!(
            "Rolling back {} completed tasks of workflow {}",
            completed.len(),
            workflow_id
        );

        for task in completed.iter().rev() {
            let Some(hook) = &task.on_rollback else {
                continue;
            };

            match hook.run().await {
                Ok(()) => {
                    debug!("Rolled back task {}", task.id);
                    self.update(workflow_id, |record| {
                        record.log("task:rolledback", json!({ "taskId": task.id }))
                    });
                }
                Err(e) => {
                    warn!("Rollback of task {} failed: {}", task.id, e);
                    self.update(workflow_id, |record| {
                        record.log(
                            "rollback:error",
                            json!({ "taskId": task.id, "error": e.to_string() }),
                        )
                    });
                }
            }
        }
    }

    async fn remember(&self, entry: MemoryEntry) {
        let Some(memory) = &self.memory else {
            return;
        };
        let id = entry.id.clone();
        if let Err(e) = memory.store(entry).await {
            warn!("Memory sink failed to store {}: {}", id, e);
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.workflow_ids())
            .finish_non_exhaustive()
    }
}
