//! Stages and the StageRunner.
//!
//! A `Stage` pairs a name and a failure policy with a `NodeAction`. The
//! runner fans the action out over the live node set through the
//! `NodeWorkerPool`, reports each node as it finishes and decides whether
//! the stage as a whole passed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::pool::NodeWorkerPool;
use super::tasks::TaskManager;
use crate::cancel::CancelToken;
use crate::domain::{
    EngineError, EventDraft, EventKind, ExecError, Node, NodeFacts, NodeOutcome, NodeStatus,
    TaskId,
};
use crate::ports::RemoteExecutor;

/// Per-node facts for a run, keyed by node id.
pub type FactsByNode = BTreeMap<String, NodeFacts>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StagePolicy {
    /// Any node failure fails the stage (and the deployment).
    #[default]
    AllMustSucceed,
    /// Failed nodes are dropped; the stage passes if any node succeeded.
    BestEffort,
}

impl fmt::Display for StagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagePolicy::AllMustSucceed => f.write_str("all-must-succeed"),
            StagePolicy::BestEffort => f.write_str("best-effort"),
        }
    }
}

/// What an action produced on one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub output: String,
    /// Facts to merge into the node's facts for later stages.
    pub facts: NodeFacts,
}

impl ActionOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            facts: NodeFacts::new(),
        }
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }
}

/// The per-node unit of work of a stage.
#[async_trait]
pub trait NodeAction: Send + Sync {
    async fn run(
        &self,
        node: &Node,
        facts: &NodeFacts,
        cancel: &CancelToken,
    ) -> Result<ActionOutput, ExecError>;

    /// Human-readable description (shown by `--dry-run`).
    fn describe(&self) -> String;
}

/// Runs one templated shell command on the node.
///
/// Placeholders: `{node}` (node id), `{host}`, `{user}` and any fact key
/// (e.g. `{os}`). Unknown placeholders are left untouched.
pub struct CommandAction {
    executor: Arc<dyn RemoteExecutor>,
    template: String,
    timeout: Duration,
}

impl CommandAction {
    pub fn new(executor: Arc<dyn RemoteExecutor>, template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            template: template.into(),
            timeout,
        }
    }

    pub fn render(&self, node: &Node, facts: &NodeFacts) -> String {
        let mut command = self
            .template
            .replace("{node}", &node.id)
            .replace("{host}", &node.host)
            .replace("{user}", &node.user);
        for (key, value) in facts {
            command = command.replace(&format!("{{{key}}}"), value);
        }
        command
    }
}

#[async_trait]
impl NodeAction for CommandAction {
    async fn run(
        &self,
        node: &Node,
        facts: &NodeFacts,
        cancel: &CancelToken,
    ) -> Result<ActionOutput, ExecError> {
        let command = self.render(node, facts);
        let output = self.executor.execute(node, &command, self.timeout, cancel).await?;
        Ok(ActionOutput::new(output))
    }

    fn describe(&self) -> String {
        self.template.clone()
    }
}

pub const OS_FACT: &str = "os";

/// Connectivity check: proves the node answers and records its OS as the
/// `os` fact (lower-cased `uname -s`).
pub struct DetectOsAction {
    executor: Arc<dyn RemoteExecutor>,
    timeout: Duration,
}

impl DetectOsAction {
    pub const COMMAND: &'static str = "uname -s";

    pub fn new(executor: Arc<dyn RemoteExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

#[async_trait]
impl NodeAction for DetectOsAction {
    async fn run(
        &self,
        node: &Node,
        _facts: &NodeFacts,
        cancel: &CancelToken,
    ) -> Result<ActionOutput, ExecError> {
        let output = self
            .executor
            .execute(node, Self::COMMAND, self.timeout, cancel)
            .await?;
        let os = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("unknown")
            .to_lowercase();
        Ok(ActionOutput::new(output).with_fact(OS_FACT, os))
    }

    fn describe(&self) -> String {
        Self::COMMAND.to_string()
    }
}

#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub policy: StagePolicy,
    pub action: Arc<dyn NodeAction>,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: Arc<dyn NodeAction>) -> Self {
        Self {
            name: name.into(),
            policy: StagePolicy::default(),
            action,
        }
    }

    pub fn with_policy(mut self, policy: StagePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// The run was cancelled while the stage was in flight.
    Interrupted,
}

/// Where a stage sits in its pipeline (for progress).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePosition {
    pub index: usize,
    pub total: usize,
}

impl StagePosition {
    pub fn progress_before(&self) -> f64 {
        self.index as f64 / self.total.max(1) as f64
    }

    pub fn progress_after(&self) -> f64 {
        (self.index + 1) as f64 / self.total.max(1) as f64
    }
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    /// One outcome per input node, in input order.
    pub outcomes: Vec<NodeOutcome>,
    /// Nodes handed to the next stage.
    pub surviving: Vec<Node>,
    /// Aggregated failure message when the stage did not pass.
    pub summary: Option<String>,
}

impl StageResult {
    pub fn into_error(self) -> EngineError {
        EngineError::StageFailed {
            stage: self.stage,
            summary: self.summary.unwrap_or_default(),
        }
    }
}

pub struct StageRunner {
    tasks: Arc<TaskManager>,
    pool: NodeWorkerPool,
    output_limit: usize,
}

impl StageRunner {
    pub fn new(tasks: Arc<TaskManager>, pool: NodeWorkerPool, output_limit: usize) -> Self {
        Self {
            tasks,
            pool,
            output_limit,
        }
    }

    /// Run `stage` over `nodes`. Facts learned on succeeding nodes are merged
    /// into `facts`.
    ///
    /// Emits one `step-start`, one `step-log` per node and then `step-done`
    /// (passed) or `error` (failed or interrupted).
    pub async fn run_stage(
        &self,
        task_id: TaskId,
        stage: &Stage,
        nodes: &[Node],
        facts: &mut FactsByNode,
        position: StagePosition,
        cancel: &CancelToken,
    ) -> Result<StageResult, EngineError> {
        info!(task_id = %task_id, stage = %stage.name, nodes = nodes.len(), policy = %stage.policy, "stage starting");
        self.tasks
            .begin_stage(
                task_id,
                EventDraft::new(
                    EventKind::StepStart,
                    format!("{} starting on {} node(s)", stage.name, nodes.len()),
                )
                .step(&stage.name)
                .progress(position.progress_before()),
            )
            .await?;

        let mut run = self.pool.spawn_over_nodes(&stage.name, nodes, cancel, {
            let action = Arc::clone(&stage.action);
            let stage_name = stage.name.clone();
            let facts = Arc::new(facts.clone());
            move |node: Node, cancel: CancelToken| {
                let action = Arc::clone(&action);
                let stage_name = stage_name.clone();
                let node_facts = facts.get(&node.id).cloned().unwrap_or_default();
                async move { run_action(&*action, &stage_name, node, node_facts, cancel).await }
            }
        });

        while let Some((index, outcome)) = run.next().await {
            let draft = self.step_log(stage, &nodes[index], &outcome);
            if let Err(err) = self.tasks.record_node_result(task_id, &outcome, draft).await {
                warn!(task_id = %task_id, node = %outcome.node_id, error = %err, "recording node result failed");
            }
        }
        let outcomes = run.finish().await;

        for outcome in outcomes.iter().filter(|o| o.is_success()) {
            facts
                .entry(outcome.node_id.clone())
                .or_default()
                .extend(outcome.facts.clone());
        }

        let result = evaluate(stage, nodes, outcomes, cancel);
        match result.status {
            StageStatus::Succeeded => {
                let ok = result.surviving.len();
                info!(task_id = %task_id, stage = %stage.name, succeeded = ok, "stage done");
                self.tasks
                    .add_event(
                        task_id,
                        EventDraft::new(
                            EventKind::StepDone,
                            format!("{} done: {}/{} node(s) succeeded", stage.name, ok, nodes.len()),
                        )
                        .step(&stage.name)
                        .progress(position.progress_after()),
                    )
                    .await?;
            }
            StageStatus::Failed => {
                let summary = result.summary.clone().unwrap_or_default();
                warn!(task_id = %task_id, stage = %stage.name, %summary, "stage failed");
                self.tasks
                    .add_event(
                        task_id,
                        EventDraft::new(EventKind::Error, summary)
                            .step(&stage.name)
                            .progress(position.progress_before()),
                    )
                    .await?;
            }
            StageStatus::Interrupted => {
                let reason = cancel
                    .reason()
                    .map_or_else(|| "cancelled".to_string(), |r| r.to_string());
                info!(task_id = %task_id, stage = %stage.name, %reason, "stage interrupted");
                let draft = EventDraft::new(EventKind::Error, format!("stage interrupted: {reason}"))
                    .step(&stage.name)
                    .progress(position.progress_before());
                match self.tasks.add_event(task_id, draft).await {
                    Ok(_) | Err(EngineError::AlreadyTerminal { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(result)
    }

    fn step_log(&self, stage: &Stage, node: &Node, outcome: &NodeOutcome) -> EventDraft {
        let output = truncate_output(outcome.output.as_deref().unwrap_or(""), self.output_limit);
        let message = match (&outcome.status, &outcome.error) {
            (NodeStatus::Succeeded, _) if output.trim().is_empty() => "ok".to_string(),
            (NodeStatus::Succeeded, _) => output.trim_end().to_string(),
            (NodeStatus::Cancelled, _) => "cancelled".to_string(),
            (NodeStatus::Failed, Some(error)) => error.clone(),
            (NodeStatus::Failed, None) => "failed".to_string(),
        };
        EventDraft::new(EventKind::StepLog, message)
            .step(&stage.name)
            .host(&node.host)
            .data(json!({
                "node_id": node.id,
                "status": outcome.status,
                "output": output,
                "duration_ms": outcome.duration.as_millis() as u64,
            }))
    }
}

async fn run_action(
    action: &dyn NodeAction,
    stage: &str,
    node: Node,
    facts: NodeFacts,
    cancel: CancelToken,
) -> NodeOutcome {
    let started = Instant::now();
    match action.run(&node, &facts, &cancel).await {
        Ok(out) => NodeOutcome::succeeded(&node, stage, out.output, started.elapsed())
            .with_facts(out.facts),
        Err(ExecError::Cancelled { output }) => {
            NodeOutcome::cancelled(&node, stage).with_output(output)
        }
        Err(err) => {
            warn!(node = %node.id, stage, error = %err, "node failed");
            let output = err.output().to_string();
            NodeOutcome::failed(&node, stage, err.to_string(), started.elapsed()).with_output(output)
        }
    }
}

fn evaluate(
    stage: &Stage,
    nodes: &[Node],
    outcomes: Vec<NodeOutcome>,
    cancel: &CancelToken,
) -> StageResult {
    let surviving: Vec<Node> = nodes
        .iter()
        .zip(&outcomes)
        .filter(|(_, o)| o.is_success())
        .map(|(n, _)| n.clone())
        .collect();

    let interrupted = cancel.is_cancelled()
        || outcomes.iter().any(|o| o.status == NodeStatus::Cancelled);
    let failed: Vec<&NodeOutcome> = outcomes
        .iter()
        .filter(|o| o.status == NodeStatus::Failed)
        .collect();

    let status = if interrupted {
        StageStatus::Interrupted
    } else {
        match stage.policy {
            StagePolicy::AllMustSucceed if !failed.is_empty() => StageStatus::Failed,
            StagePolicy::BestEffort if !nodes.is_empty() && surviving.is_empty() => {
                StageStatus::Failed
            }
            _ => StageStatus::Succeeded,
        }
    };

    let summary = (status == StageStatus::Failed).then(|| summarize(&failed, nodes.len()));
    StageResult {
        stage: stage.name.clone(),
        status,
        outcomes,
        surviving,
        summary,
    }
}

fn summarize(failed: &[&NodeOutcome], total: usize) -> String {
    let details: Vec<String> = failed
        .iter()
        .map(|o| format!("{}: {}", o.node_id, o.error.as_deref().unwrap_or("failed")))
        .collect();
    format!("{}/{} node(s) failed: {}", failed.len(), total, details.join("; "))
}

/// Keep at most `limit` bytes of `output`, cut on a char boundary.
pub fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated {} bytes]", &output[..end], output.len() - end)
}
