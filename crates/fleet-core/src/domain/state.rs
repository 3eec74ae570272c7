//! State - タスクの状態
//!
//! 終端状態（completed / failed / cancelled / timeout）に入ったタスクは
//! 二度と状態を変えません。リトライは新しいタスクとして作られます。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// TaskStatus はタスクの状態を表現
///
/// # 状態遷移
/// - pending -> running -> completed
/// - pending -> running -> failed | cancelled | timeout
/// - pending -> cancelled（デプロイ開始前のキャンセル）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by an orchestrator.
    Pending,

    /// An orchestrator run is advancing through stages.
    Running,

    /// Every stage succeeded.
    Completed,

    /// A stage failed (or the run could not be started).
    Failed,

    /// Cancelled by an external request.
    Cancelled,

    /// The run exceeded its deadline.
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Can an external cancel request still affect this task?
    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("invalid task status: {s}"))
    }
}
