//! TaskManager - task records and their event logs.
//!
//! Every mutation is a read-modify-write against the `TaskStore` under one
//! lock, so the events of a task get gap-free sequence numbers and reach the
//! store and the broadcaster in the same order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::broadcaster::ProgressBroadcaster;
use crate::domain::{
    Completion, EngineError, EventDraft, EventKind, NodeCounters, NodeOutcome, NodeStatus,
    TaskEvent, TaskId, TaskRecord, TaskSpec, TaskStatus,
};
use crate::observability::TaskCounts;
use crate::ports::{Clock, IdGenerator, Page, TaskFilter, TaskPage, TaskStore};

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    default_max_retries: u32,
    lock: Mutex<()>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broadcaster: Arc<ProgressBroadcaster>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            broadcaster,
            clock,
            ids,
            default_max_retries,
            lock: Mutex::new(()),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    async fn load(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        self.store
            .load_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Assign the next sequence number, persist the record, then append and
    /// publish the event. Caller holds `lock`.
    async fn append(
        &self,
        record: &mut TaskRecord,
        draft: EventDraft,
    ) -> Result<TaskEvent, EngineError> {
        let seq = record.take_event_seq();
        let event = TaskEvent::from_draft(record.task_id, seq, draft, self.clock.now());
        self.store.save_task(record).await?;
        self.store.append_event(&event).await?;
        self.broadcaster.publish(&event);
        Ok(event)
    }

    /// Create a `pending` task and emit `created`.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskRecord, EngineError> {
        let _guard = self.lock.lock().await;

        let task_id = self.ids.generate_task_id();
        let mut record = TaskRecord::new(task_id, spec, self.default_max_retries, self.clock.now());
        self.store.save_task(&record).await?;
        self.broadcaster.open(task_id, record.status);

        let message = format!("task {} created", record.name);
        self.append(&mut record, EventDraft::new(EventKind::Created, message))
            .await?;

        info!(task_id = %task_id, name = %record.name, op_type = %record.op_type, "task created");
        Ok(record)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        self.load(task_id).await
    }

    pub async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: Page,
    ) -> Result<TaskPage, EngineError> {
        Ok(self.store.list_tasks(filter, page).await?)
    }

    pub async fn list_events(&self, task_id: TaskId) -> Result<Vec<TaskEvent>, EngineError> {
        self.load(task_id).await?;
        Ok(self.store.list_events(task_id).await?)
    }

    /// `pending -> running`; emits `start`.
    pub async fn mark_running(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;

        if !record.mark_running(self.clock.now()) {
            return Err(EngineError::AlreadyTerminal {
                task_id,
                status: record.status,
            });
        }
        self.broadcaster.set_status(task_id, record.status);
        self.append(&mut record, EventDraft::new(EventKind::Start, "deployment started"))
            .await?;

        info!(task_id = %task_id, "task running");
        Ok(record)
    }

    /// Record progress. Returns `false` (and changes nothing) when the task is
    /// terminal. Progress is clamped to `[0, 1]` and never decreases.
    pub async fn update_progress(
        &self,
        task_id: TaskId,
        progress: f64,
        step: &str,
    ) -> Result<bool, EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;

        if !record.set_progress(progress, step) {
            debug!(task_id = %task_id, "progress update on terminal task ignored");
            return Ok(false);
        }
        self.store.save_task(&record).await?;
        Ok(true)
    }

    /// Append an event to a live task's log.
    pub async fn add_event(
        &self,
        task_id: TaskId,
        draft: EventDraft,
    ) -> Result<TaskEvent, EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;

        if record.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                task_id,
                status: record.status,
            });
        }
        self.append(&mut record, draft).await
    }

    /// Move the task into a terminal status, emit the matching terminal event
    /// and close its subscribers.
    ///
    /// The first terminal write wins; later calls report what is recorded and
    /// change nothing.
    pub async fn complete(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<Completion, EngineError> {
        debug_assert!(status.is_terminal());
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;

        let completion = record.finish(status, reason.clone(), self.clock.now());
        if completion != Completion::Applied {
            debug!(task_id = %task_id, ?completion, requested = %status, "terminal write ignored");
            return Ok(completion);
        }

        let (kind, default_message) = match status {
            TaskStatus::Completed => (EventKind::Complete, "deployment completed"),
            TaskStatus::Cancelled => (EventKind::Cancelled, "deployment cancelled"),
            TaskStatus::Timeout => (EventKind::Error, "deployment timed out"),
            _ => (EventKind::Error, "deployment failed"),
        };
        let mut draft = EventDraft::new(kind, reason.unwrap_or_else(|| default_message.to_string()))
            .progress(record.progress);
        if kind == EventKind::Error {
            draft = draft.step(record.current_step.clone());
        }
        self.append(&mut record, draft).await?;
        self.broadcaster.close(task_id, status);

        let duration_ms = record.duration().map(|d| d.num_milliseconds());
        info!(task_id = %task_id, status = %status, ?duration_ms, "task finished");
        Ok(Completion::Applied)
    }

    pub async fn set_node_total(&self, task_id: TaskId, total: usize) -> Result<(), EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;
        record.nodes.total = u32::try_from(total).unwrap_or(u32::MAX);
        self.store.save_task(&record).await?;
        Ok(())
    }

    /// Emit a stage's `step-start` and reset the per-stage success counter.
    pub async fn begin_stage(
        &self,
        task_id: TaskId,
        draft: EventDraft,
    ) -> Result<TaskEvent, EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;

        if record.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                task_id,
                status: record.status,
            });
        }
        record.nodes.succeeded = 0;
        self.append(&mut record, draft).await
    }

    /// Fold one node's stage outcome into the counters and emit its
    /// `step-log` event in the same write.
    pub async fn record_node_result(
        &self,
        task_id: TaskId,
        outcome: &NodeOutcome,
        draft: EventDraft,
    ) -> Result<NodeCounters, EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;

        if record.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                task_id,
                status: record.status,
            });
        }
        match outcome.status {
            NodeStatus::Succeeded => record.nodes.succeeded += 1,
            NodeStatus::Failed => record.nodes.failed += 1,
            NodeStatus::Cancelled => {}
        }
        self.append(&mut record, draft).await?;
        Ok(record.nodes)
    }

    /// Record how many nodes made it through every stage.
    pub async fn finish_nodes(
        &self,
        task_id: TaskId,
        succeeded: usize,
    ) -> Result<NodeCounters, EngineError> {
        let _guard = self.lock.lock().await;
        let mut record = self.load(task_id).await?;
        record.nodes.succeeded = u32::try_from(succeeded).unwrap_or(u32::MAX);
        self.store.save_task(&record).await?;
        Ok(record.nodes)
    }

    /// Create the next attempt of a failed task and bump the original's
    /// retry counter. The new task starts `pending`.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<TaskRecord, EngineError> {
        let spec = {
            let _guard = self.lock.lock().await;
            let mut original = self.load(task_id).await?;

            if !original.can_retry() {
                return Err(EngineError::NotRetryable {
                    task_id,
                    status: original.status,
                    retry_count: original.retry_count,
                    max_retries: original.max_retries,
                });
            }
            original.retry_count += 1;
            self.store.save_task(&original).await?;
            original.retry_spec()
        };

        let retry = self.create_task(spec).await?;
        info!(task_id = %task_id, retry_id = %retry.task_id, "retry task created");
        Ok(retry)
    }

    pub async fn counts_by_status(&self) -> Result<TaskCounts, EngineError> {
        let all = self
            .store
            .list_tasks(&TaskFilter::default(), Page { offset: 0, limit: usize::MAX })
            .await?;
        let mut counts = TaskCounts::default();
        for task in &all.items {
            counts.record(task.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Node;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::time::Duration;

    fn manager() -> (TaskManager, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let manager = TaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(ProgressBroadcaster::new(16)),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            3,
        );
        (manager, clock)
    }

    fn spec() -> TaskSpec {
        TaskSpec::new("deploy prod", "deploy", "alice").with_nodes(["a", "b"])
    }

    #[tokio::test]
    async fn create_emits_created_event() {
        let (tasks, _) = manager();
        let task = tasks.create_task(spec()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        let events = tasks.list_events(task.task_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Created);
        assert_eq!(events[0].seq, 0);
    }

    #[tokio::test]
    async fn mark_running_sets_started_at_and_emits_start() {
        let (tasks, clock) = manager();
        let task = tasks.create_task(spec()).await.unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let running = tasks.mark_running(task.task_id).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.started_at, Some(clock.now()));

        let kinds: Vec<_> = tasks
            .list_events(task.task_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Start]);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_clamped() {
        let (tasks, _) = manager();
        let id = tasks.create_task(spec()).await.unwrap().task_id;
        tasks.mark_running(id).await.unwrap();

        tasks.update_progress(id, 0.5, "agent-install").await.unwrap();
        tasks.update_progress(id, 0.2, "late-report").await.unwrap();
        assert_eq!(tasks.get_task(id).await.unwrap().progress, 0.5);

        tasks.update_progress(id, 7.0, "overshoot").await.unwrap();
        assert_eq!(tasks.get_task(id).await.unwrap().progress, 1.0);
    }

    #[rstest]
    #[case::completed(TaskStatus::Completed, EventKind::Complete)]
    #[case::failed(TaskStatus::Failed, EventKind::Error)]
    #[case::cancelled(TaskStatus::Cancelled, EventKind::Cancelled)]
    #[case::timeout(TaskStatus::Timeout, EventKind::Error)]
    #[tokio::test]
    async fn complete_emits_terminal_event(#[case] status: TaskStatus, #[case] kind: EventKind) {
        let (tasks, _) = manager();
        let id = tasks.create_task(spec()).await.unwrap().task_id;
        tasks.mark_running(id).await.unwrap();

        assert_eq!(
            tasks.complete(id, status, None).await.unwrap(),
            Completion::Applied
        );
        let task = tasks.get_task(id).await.unwrap();
        assert_eq!(task.status, status);
        assert!(task.ended_at.is_some());

        let last = tasks.list_events(id).await.unwrap().pop().unwrap();
        assert_eq!(last.kind, kind);
    }

    #[tokio::test]
    async fn terminal_task_rejects_further_changes() {
        let (tasks, _) = manager();
        let id = tasks.create_task(spec()).await.unwrap().task_id;
        tasks.mark_running(id).await.unwrap();
        tasks
            .complete(id, TaskStatus::Failed, Some("stage agent-install failed".into()))
            .await
            .unwrap();

        assert!(!tasks.update_progress(id, 0.9, "x").await.unwrap());
        assert!(matches!(
            tasks.add_event(id, EventDraft::new(EventKind::StepLog, "late")).await,
            Err(EngineError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            tasks.mark_running(id).await,
            Err(EngineError::AlreadyTerminal { .. })
        ));
        assert_eq!(
            tasks.complete(id, TaskStatus::Failed, None).await.unwrap(),
            Completion::Unchanged
        );
        assert_eq!(
            tasks.complete(id, TaskStatus::Completed, None).await.unwrap(),
            Completion::AlreadyTerminal {
                recorded: TaskStatus::Failed
            }
        );

        let task = tasks.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("stage agent-install failed"));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (tasks, _) = manager();
        let (other, _) = manager();
        let id = other.create_task(spec()).await.unwrap().task_id;

        assert!(matches!(
            tasks.add_event(id, EventDraft::new(EventKind::StepLog, "")).await,
            Err(EngineError::TaskNotFound(got)) if got == id
        ));
    }

    #[tokio::test]
    async fn node_results_update_counters() {
        let (tasks, _) = manager();
        let id = tasks.create_task(spec()).await.unwrap().task_id;
        tasks.mark_running(id).await.unwrap();
        tasks.set_node_total(id, 2).await.unwrap();

        let a = Node::new("a");
        let b = Node::new("b");
        let ok = NodeOutcome::succeeded(&a, "s", String::new(), Duration::ZERO);
        let bad = NodeOutcome::failed(&b, "s", "exit 1", Duration::ZERO);
        tasks
            .begin_stage(id, EventDraft::new(EventKind::StepStart, "s"))
            .await
            .unwrap();
        let counters = tasks
            .record_node_result(id, &ok, EventDraft::new(EventKind::StepLog, "ok"))
            .await
            .unwrap();
        assert_eq!(counters, NodeCounters { total: 2, succeeded: 1, failed: 0 });
        let counters = tasks
            .record_node_result(id, &bad, EventDraft::new(EventKind::StepLog, "failed"))
            .await
            .unwrap();
        assert_eq!(counters, NodeCounters { total: 2, succeeded: 1, failed: 1 });

        // The next stage starts counting its own passes.
        tasks
            .begin_stage(id, EventDraft::new(EventKind::StepStart, "t"))
            .await
            .unwrap();
        assert_eq!(tasks.get_task(id).await.unwrap().nodes.succeeded, 0);

        let counters = tasks.finish_nodes(id, 1).await.unwrap();
        assert_eq!(counters.succeeded, 1);
    }

    #[tokio::test]
    async fn retry_creates_tagged_task_until_exhausted() {
        let (tasks, _) = manager();
        let spec = spec().with_max_retries(1).with_tag("prod");
        let id = tasks.create_task(spec).await.unwrap().task_id;
        tasks.mark_running(id).await.unwrap();
        tasks.complete(id, TaskStatus::Failed, None).await.unwrap();

        let retry = tasks.retry_task(id).await.unwrap();
        assert_ne!(retry.task_id, id);
        assert_eq!(retry.status, TaskStatus::Pending);
        assert_eq!(retry.retry_of, Some(id));
        assert_eq!(retry.tags, vec!["prod".to_string(), "retry".to_string()]);
        assert_eq!(retry.node_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tasks.get_task(id).await.unwrap().retry_count, 1);

        let before = tasks.counts_by_status().await.unwrap();
        assert!(matches!(
            tasks.retry_task(id).await,
            Err(EngineError::NotRetryable { retry_count: 1, max_retries: 1, .. })
        ));
        assert_eq!(tasks.counts_by_status().await.unwrap(), before);
    }

    #[tokio::test]
    async fn only_failed_tasks_are_retryable() {
        let (tasks, _) = manager();
        let id = tasks.create_task(spec()).await.unwrap().task_id;
        assert!(matches!(
            tasks.retry_task(id).await,
            Err(EngineError::NotRetryable { status: TaskStatus::Pending, .. })
        ));
    }

    #[tokio::test]
    async fn counts_group_by_status() {
        let (tasks, _) = manager();
        let a = tasks.create_task(spec()).await.unwrap().task_id;
        tasks.create_task(spec()).await.unwrap();
        tasks.mark_running(a).await.unwrap();

        let counts = tasks.counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 2);
    }
}
