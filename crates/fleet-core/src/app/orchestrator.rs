//! DeploymentOrchestrator - drives one task through a pipeline.
//!
//! `pending -> running -> {completed, failed, cancelled, timeout}`
//!
//! Stages run strictly in order over the live node set. The first failing
//! stage halts the run; later stages are skipped and nothing is rolled back.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::pipeline::Pipeline;
use super::pool::NodeWorkerPool;
use super::stage::{FactsByNode, StagePosition, StageRunner, StageStatus};
use super::tasks::TaskManager;
use crate::cancel::{CancelHandle, CancelReason, CancelToken};
use crate::domain::{EngineError, Node, TaskId, TaskRecord, TaskStatus};

enum RunEnd {
    Completed { surviving: usize },
    Failed(EngineError),
    Interrupted,
}

pub struct DeploymentOrchestrator {
    tasks: Arc<TaskManager>,
    runner: StageRunner,
    task_timeout: Option<Duration>,
}

impl DeploymentOrchestrator {
    pub fn new(
        tasks: Arc<TaskManager>,
        pool: NodeWorkerPool,
        output_limit: usize,
        task_timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner: StageRunner::new(Arc::clone(&tasks), pool, output_limit),
            tasks,
            task_timeout,
        }
    }

    /// Run `pipeline` for `task_id` over `nodes` and leave the task in a
    /// terminal status. Returns the final record.
    ///
    /// A task that is already terminal (e.g. cancelled while pending) is
    /// returned unchanged without running anything.
    pub async fn run(
        &self,
        task_id: TaskId,
        nodes: Vec<Node>,
        pipeline: &Pipeline,
        cancel: &CancelHandle,
    ) -> Result<TaskRecord, EngineError> {
        match self.tasks.mark_running(task_id).await {
            Ok(_) => {}
            Err(EngineError::AlreadyTerminal { status, .. }) => {
                info!(task_id = %task_id, %status, "task already finished; deployment not started");
                return self.tasks.get_task(task_id).await;
            }
            Err(err) => return Err(err),
        }
        self.tasks.set_node_total(task_id, nodes.len()).await?;

        let token = cancel.token();
        let stages = self.run_stages(task_id, nodes, pipeline, &token);
        let end = match self.task_timeout {
            Some(limit) => {
                tokio::pin!(stages);
                tokio::select! {
                    end = &mut stages => end,
                    _ = tokio::time::sleep(limit) => {
                        warn!(task_id = %task_id, timeout_secs = limit.as_secs(), "deployment deadline exceeded");
                        cancel.cancel(CancelReason::Deadline);
                        stages.await
                    }
                }
            }
            None => stages.await,
        };

        let (status, reason) = match end {
            Ok(RunEnd::Completed { surviving }) => {
                self.tasks.finish_nodes(task_id, surviving).await?;
                (TaskStatus::Completed, None)
            }
            Ok(RunEnd::Failed(err)) => (TaskStatus::Failed, Some(err.to_string())),
            Ok(RunEnd::Interrupted) => match token.reason() {
                Some(CancelReason::Deadline) => (
                    TaskStatus::Timeout,
                    Some(match self.task_timeout {
                        Some(limit) => format!("deadline of {}s exceeded", limit.as_secs()),
                        None => CancelReason::Deadline.to_string(),
                    }),
                ),
                Some(reason) => (TaskStatus::Cancelled, Some(reason.to_string())),
                None => (TaskStatus::Cancelled, None),
            },
            // Someone else finished the task underneath us.
            Err(EngineError::AlreadyTerminal { .. }) => return self.tasks.get_task(task_id).await,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "deployment aborted");
                (TaskStatus::Failed, Some(err.to_string()))
            }
        };

        self.tasks.complete(task_id, status, reason).await?;
        self.tasks.get_task(task_id).await
    }

    async fn run_stages(
        &self,
        task_id: TaskId,
        mut nodes: Vec<Node>,
        pipeline: &Pipeline,
        cancel: &CancelToken,
    ) -> Result<RunEnd, EngineError> {
        let mut facts = FactsByNode::new();
        let total = pipeline.len();

        for (index, stage) in pipeline.stages().iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Interrupted);
            }
            let position = StagePosition { index, total };
            self.tasks
                .update_progress(task_id, position.progress_before(), &stage.name)
                .await?;

            let result = self
                .runner
                .run_stage(task_id, stage, &nodes, &mut facts, position, cancel)
                .await?;
            match result.status {
                StageStatus::Succeeded => {
                    nodes = result.surviving;
                    self.tasks
                        .update_progress(task_id, position.progress_after(), &stage.name)
                        .await?;
                }
                StageStatus::Failed => return Ok(RunEnd::Failed(result.into_error())),
                StageStatus::Interrupted => return Ok(RunEnd::Interrupted),
            }
        }
        Ok(RunEnd::Completed {
            surviving: nodes.len(),
        })
    }
}
