//! Engine - the caller-facing surface over tasks, deployments and progress.
//!
//! Constructed once at the composition root (see `EngineBuilder`) and shared
//! by `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::broadcaster::{ProgressBroadcaster, Snapshot, Subscription};
use super::orchestrator::DeploymentOrchestrator;
use super::pipeline::Pipeline;
use super::tasks::TaskManager;
use crate::cancel::{CancelHandle, CancelReason, cancel_pair};
use crate::domain::{EngineError, Node, TaskId, TaskRecord, TaskSpec, TaskStatus};
use crate::observability::TaskCounts;
use crate::ports::{Page, TaskFilter, TaskPage};

type RunHandle = JoinHandle<Result<TaskRecord, EngineError>>;

pub struct Engine {
    tasks: Arc<TaskManager>,
    broadcaster: Arc<ProgressBroadcaster>,
    orchestrator: Arc<DeploymentOrchestrator>,
    /// Cancel handles of deployments still in flight.
    cancels: Arc<Mutex<HashMap<TaskId, Arc<CancelHandle>>>>,
    /// Join handles of deployments still in flight and not yet claimed by
    /// `join`. A finished run removes its own entry.
    runs: Arc<Mutex<HashMap<TaskId, RunHandle>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub(crate) fn new(
        tasks: Arc<TaskManager>,
        orchestrator: Arc<DeploymentOrchestrator>,
    ) -> Self {
        Self {
            broadcaster: Arc::clone(tasks.broadcaster()),
            tasks,
            orchestrator,
            cancels: Arc::new(Mutex::new(HashMap::new())),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskRecord, EngineError> {
        self.tasks.create_task(spec).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        self.tasks.get_task(task_id).await
    }

    pub async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<TaskPage, EngineError> {
        self.tasks.list_tasks(filter, page).await
    }

    pub async fn counts(&self) -> Result<TaskCounts, EngineError> {
        self.tasks.counts_by_status().await
    }

    /// Start running `pipeline` for a pending task on a background tokio task.
    pub async fn start_deployment(
        &self,
        task_id: TaskId,
        nodes: Vec<Node>,
        pipeline: Pipeline,
    ) -> Result<(), EngineError> {
        let task = self.tasks.get_task(task_id).await?;
        if task.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                task_id,
                status: task.status,
            });
        }

        let (handle, _token) = cancel_pair();
        let handle = Arc::new(handle);
        {
            let mut cancels = locked(self.cancels.as_ref());
            if task.status == TaskStatus::Running || cancels.contains_key(&task_id) {
                return Err(EngineError::AlreadyRunning(task_id));
            }
            cancels.insert(task_id, Arc::clone(&handle));
        }

        info!(task_id = %task_id, nodes = nodes.len(), stages = pipeline.len(), "deployment starting");
        let orchestrator = Arc::clone(&self.orchestrator);
        let cancels = Arc::clone(&self.cancels);
        let runs = Arc::clone(&self.runs);
        // Held until the handle is registered, so a run that finishes at once
        // cannot unregister itself before it is inserted.
        let mut registered = locked(self.runs.as_ref());
        let join = tokio::spawn(async move {
            let result = orchestrator.run(task_id, nodes, &pipeline, &handle).await;
            locked(cancels.as_ref()).remove(&task_id);
            locked(runs.as_ref()).remove(&task_id);
            if let Err(err) = &result {
                warn!(task_id = %task_id, error = %err, "deployment ended with error");
            }
            result
        });
        registered.insert(task_id, join);
        Ok(())
    }

    /// Wait for a started deployment to finish and return the final record.
    /// For a task with no deployment in flight, returns its current record.
    pub async fn join(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        let join = locked(self.runs.as_ref()).remove(&task_id);
        match join {
            Some(join) => match join.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "deployment task aborted");
                    self.tasks.get_task(task_id).await
                }
            },
            None => self.tasks.get_task(task_id).await,
        }
    }

    /// Cancel a pending or running task.
    ///
    /// A pending task becomes `cancelled` immediately. A running task has its
    /// token signalled and becomes `cancelled` once the in-flight stage has
    /// unwound; `join` waits for that.
    pub async fn cancel_task(&self, task_id: TaskId, reason: &str) -> Result<(), EngineError> {
        let task = self.tasks.get_task(task_id).await?;
        if !task.can_cancel() {
            return Err(EngineError::NotCancellable {
                task_id,
                status: task.status,
            });
        }

        let handle = locked(self.cancels.as_ref()).get(&task_id).cloned();
        if let Some(handle) = &handle {
            handle.cancel(CancelReason::Requested(reason.to_string()));
        }
        info!(task_id = %task_id, status = %task.status, reason, "cancel requested");

        // Nothing will unwind a pending task on its own.
        if task.status == TaskStatus::Pending || handle.is_none() {
            let reason = CancelReason::Requested(reason.to_string()).to_string();
            self.tasks
                .complete(task_id, TaskStatus::Cancelled, Some(reason))
                .await?;
        }
        Ok(())
    }

    /// Create the next attempt of a failed task. The new task is `pending`;
    /// start it with `start_deployment`.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        self.tasks.retry_task(task_id).await
    }

    /// Subscribe to a task's progress: backlog first, then live events until
    /// the task is terminal.
    pub async fn subscribe(&self, task_id: TaskId) -> Result<Subscription, EngineError> {
        if let Some(subscription) = self.broadcaster.subscribe(task_id) {
            return Ok(subscription);
        }
        // Known to the store but not to this process: replay the log.
        let events = self.tasks.list_events(task_id).await?;
        Ok(Subscription::replay(events))
    }

    pub async fn snapshot(&self, task_id: TaskId) -> Result<Snapshot, EngineError> {
        if let Some(snapshot) = self.broadcaster.snapshot(task_id) {
            return Ok(snapshot);
        }
        let task = self.tasks.get_task(task_id).await?;
        let events = self.tasks.list_events(task_id).await?;
        Ok(Snapshot {
            status: task.status,
            events,
        })
    }

    /// Release the in-memory stream history of a finished task. The store
    /// keeps its log.
    pub fn forget(&self, task_id: TaskId) -> bool {
        self.broadcaster.forget(task_id)
    }

    /// Events dropped for slow subscribers since start.
    pub fn dropped_events(&self) -> u64 {
        self.broadcaster.dropped()
    }
}
