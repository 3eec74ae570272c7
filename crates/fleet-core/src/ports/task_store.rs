//! TaskStore port - タスクレコードとイベントログの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスクの状態（TaskRecord）
//! - タスクごとの追記専用イベントログ（TaskEvent）
//!
//! 同梱の実装は `InMemoryTaskStore`。RDB などの実装もこの trait の裏に置けます。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{StoreError, TaskEvent, TaskId, TaskRecord, TaskStatus};

/// Filter for `list_tasks`. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub op_type: Option<String>,
    pub actor_id: Option<String>,
    pub cluster_id: Option<String>,
    /// Task must carry this tag.
    pub tag: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &TaskRecord) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.op_type.as_ref().is_none_or(|t| &task.op_type == t)
            && self.actor_id.as_ref().is_none_or(|a| &task.actor_id == a)
            && self
                .cluster_id
                .as_ref()
                .is_none_or(|c| task.cluster_id.as_ref() == Some(c))
            && self.tag.as_ref().is_none_or(|t| task.tags.contains(t))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of tasks, newest first, plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub items: Vec<TaskRecord>,
    pub total: usize,
}

/// TaskStore は状態とイベント履歴の正本
///
/// # 設計原則
/// - 状態の書き込みは `TaskManager` のロック下でのみ行われる
/// - イベントは追記のみ（更新・削除しない）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite a task record.
    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    async fn load_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Append one event to its task's log.
    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError>;

    /// All events of a task, in append order.
    async fn list_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, StoreError>;

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<TaskPage, StoreError>;
}
