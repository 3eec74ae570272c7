//! Task record: one logical long-running fleet operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;
use super::state::TaskStatus;

/// Tag attached to tasks created by a retry.
pub const RETRY_TAG: &str = "retry";

/// Input for creating a task (what the boundary layer submits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human-readable name.
    pub name: String,

    /// Operation type tag (e.g. `"cluster-deploy"`).
    pub op_type: String,

    /// Originating actor (user or service account).
    pub actor_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<String>,

    /// Target/parameter payload, carried verbatim into retries.
    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// `None` means "use the engine default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Set on tasks created by `retry_task`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<TaskId>,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            actor_id: actor_id.into(),
            cluster_id: None,
            node_ids: Vec::new(),
            params: serde_json::Value::Null,
            tags: Vec::new(),
            max_retries: None,
            retry_of: None,
        }
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn with_nodes<I, S>(mut self, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_ids = node_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Node counters for the whole run.
///
/// - `total`: nodes the deployment started with.
/// - `failed`: nodes dropped because they failed a stage.
/// - `succeeded`: nodes that passed the stage in flight (or the last stage
///   run). Reset at each `step-start`, bumped on each passing node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounters {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Result of a terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The task moved into the requested terminal status.
    Applied,
    /// The task already had exactly this terminal status.
    Unchanged,
    /// The task already had a different terminal status; it was kept.
    AlreadyTerminal { recorded: TaskStatus },
}

/// The durable state of one task.
///
/// All state transitions happen through methods on this type; the
/// `TaskManager` persists the record after each one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    pub op_type: String,
    pub actor_id: String,
    pub cluster_id: Option<String>,
    pub node_ids: Vec<String>,
    pub params: serde_json::Value,
    pub tags: Vec<String>,
    pub retry_of: Option<TaskId>,

    pub status: TaskStatus,
    pub progress: f64,
    pub current_step: String,
    pub nodes: NodeCounters,

    /// Last failure/cancel reason (if any).
    pub error: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Sequence number handed to the next appended event.
    pub next_event_seq: u64,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, spec: TaskSpec, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            name: spec.name,
            op_type: spec.op_type,
            actor_id: spec.actor_id,
            cluster_id: spec.cluster_id,
            node_ids: spec.node_ids,
            params: spec.params,
            tags: spec.tags,
            retry_of: spec.retry_of,
            status: TaskStatus::Pending,
            progress: 0.0,
            current_step: String::new(),
            nodes: NodeCounters::default(),
            error: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(max_retries),
            created_at: now,
            started_at: None,
            ended_at: None,
            next_event_seq: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Failed tasks may be retried while retries remain.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn can_cancel(&self) -> bool {
        self.status.is_cancellable()
    }

    /// Wall-clock run time: `started_at` (or `created_at`) to `ended_at`.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let ended = self.ended_at?;
        Some(ended - self.started_at.unwrap_or(self.created_at))
    }

    /// Move into `Running`. `started_at` is only set on the first entry.
    ///
    /// Returns `false` (and changes nothing) when the task is terminal.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        true
    }

    /// Record progress. Ignored once terminal; progress never moves backwards.
    pub fn set_progress(&mut self, progress: f64, step: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        let progress = if progress.is_nan() {
            self.progress
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.progress = self.progress.max(progress);
        self.current_step = step.to_string();
        true
    }

    /// First terminal write wins.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Completion {
        debug_assert!(status.is_terminal());
        if self.is_terminal() {
            return if self.status == status {
                Completion::Unchanged
            } else {
                Completion::AlreadyTerminal {
                    recorded: self.status,
                }
            };
        }
        self.status = status;
        self.ended_at = Some(now);
        if status == TaskStatus::Completed {
            self.progress = 1.0;
        }
        if reason.is_some() {
            self.error = reason;
        }
        Completion::Applied
    }

    /// Spec for a fresh task retrying this one.
    pub fn retry_spec(&self) -> TaskSpec {
        let mut tags = self.tags.clone();
        if !tags.iter().any(|t| t == RETRY_TAG) {
            tags.push(RETRY_TAG.to_string());
        }
        TaskSpec {
            name: self.name.clone(),
            op_type: self.op_type.clone(),
            actor_id: self.actor_id.clone(),
            cluster_id: self.cluster_id.clone(),
            node_ids: self.node_ids.clone(),
            params: self.params.clone(),
            tags,
            max_retries: Some(self.max_retries),
            retry_of: Some(self.task_id),
        }
    }

    pub(crate) fn take_event_seq(&mut self) -> u64 {
        let seq = self.next_event_seq;
        self.next_event_seq += 1;
        seq
    }
}
