//! Errors - レイヤーごとのエラー型
//!
//! - `ExecError`: 転送・実行層。常に `NodeOutcome` に取り込まれ、ステージの外へは伝播しない
//! - `StoreError`: 永続化層の失敗
//! - `EngineError`: 状態機械のエラー。呼び出し側へ同期的に返す（部分的な変更は残さない）

use thiserror::Error;

use super::TaskId;
use super::state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Transport or authentication failure; the command never ran.
    #[error("connect to {host} failed: {message}")]
    Connect { host: String, message: String },

    /// The command exceeded its timeout and was killed.
    #[error("command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64, output: String },

    /// The command ran and signalled failure.
    #[error("command exited with status {code}")]
    NonZeroExit { code: i32, output: String },

    /// The run was cancelled while the command was in flight.
    #[error("command cancelled")]
    Cancelled { output: String },
}

impl ExecError {
    /// Output captured before the failure, if any.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Connect { .. } => "",
            ExecError::Timeout { output, .. }
            | ExecError::NonZeroExit { output, .. }
            | ExecError::Cancelled { output } => output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is already {status}")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("task {task_id} is not retryable (status={status}, retries={retry_count}/{max_retries})")]
    NotRetryable {
        task_id: TaskId,
        status: TaskStatus,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("task {task_id} cannot be cancelled (status={status})")]
    NotCancellable { task_id: TaskId, status: TaskStatus },

    #[error("stage {stage} failed: {summary}")]
    StageFailed { stage: String, summary: String },

    #[error("task {0} already has an active deployment")]
    AlreadyRunning(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
