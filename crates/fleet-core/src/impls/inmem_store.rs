//! In-memory task store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{StoreError, TaskEvent, TaskId, TaskRecord};
use crate::ports::{Page, TaskFilter, TaskPage, TaskStore};

#[derive(Default)]
struct InMemoryStoreState {
    /// All task records (single source of truth for tasks).
    tasks: HashMap<TaskId, TaskRecord>,

    /// Event logs, in append order.
    events: HashMap<TaskId, Vec<TaskEvent>>,
}

/// `TaskStore` backed by process memory. Suitable for tests and for
/// single-process deployments that accept losing history on restart.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&event.task_id) {
            return Err(StoreError::Other(format!(
                "event for unknown task {}",
                event.task_id
            )));
        }
        state
            .events
            .entry(event.task_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.events.get(&task_id).cloned().unwrap_or_default())
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<TaskPage, StoreError> {
        let state = self.state.lock().await;
        let mut matched: Vec<&TaskRecord> =
            state.tasks.values().filter(|t| filter.matches(t)).collect();

        // Newest first; ULIDs break ties between tasks created in the same ms.
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(TaskPage { items, total })
    }
}
