// tests/deployment.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::app::{
    ActionOutput, NodeAction, NodeWorkerPool, Pipeline, ProgressBroadcaster, Stage, StagePolicy,
    StagePosition, StageRunner, StageStatus, TaskManager, default_pipeline,
};
use fleet_core::cancel::CancelToken;
use fleet_core::config::{EngineConfig, PipelineConfig};
use fleet_core::domain::{
    EventKind, ExecError, Node, NodeFacts, NodeStatus, TaskSpec, TaskStatus,
};
use fleet_core::impls::InMemoryTaskStore;
use fleet_core::ports::{SystemClock, UlidGenerator};

use common::{Script, ScriptedExecutor, drain, engine, kinds, nodes, pipeline};

const STRICT: StagePolicy = StagePolicy::AllMustSucceed;
const BEST_EFFORT: StagePolicy = StagePolicy::BestEffort;

fn spec() -> TaskSpec {
    TaskSpec::new("rollout", "deploy", "alice")
}

#[tokio::test]
async fn failing_node_halts_pipeline_under_all_must_succeed() {
    let executor = ScriptedExecutor::new();
    executor.on("b", "connect", Script::Fail(1, "connection refused".into()));
    let engine = engine(EngineConfig {
        max_concurrency: 2,
        ..EngineConfig::default()
    });

    let task = engine.create_task(spec()).await.unwrap();
    let pipeline = pipeline(
        &executor,
        &[("connect", "connect {node}", STRICT), ("install", "install {node}", STRICT)],
    );
    engine
        .start_deployment(task.task_id, nodes(&["a", "b", "c"]), pipeline)
        .await
        .unwrap();
    let done = engine.join(task.task_id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.nodes.total, 3);
    assert_eq!(done.nodes.failed, 1);
    // a and c passed the stage that failed the run.
    assert_eq!(done.nodes.succeeded, 2);
    assert!(done.error.as_deref().unwrap_or("").contains("b: command exited with status 1"));

    // Every node ran stage 1, nobody ran stage 2.
    assert_eq!(executor.nodes_that_ran("connect"), vec!["a", "b", "c"]);
    assert!(executor.nodes_that_ran("install").is_empty());
    assert!(executor.peak_concurrency() <= 2);

    let events = engine.snapshot(task.task_id).await.unwrap().events;
    assert!(!kinds(&events).contains(&EventKind::StepDone));
    let logs: Vec<_> = events.iter().filter(|e| e.kind == EventKind::StepLog).collect();
    assert_eq!(logs.len(), 3);
    assert_eq!(events.last().unwrap().kind, EventKind::Error);
}

#[tokio::test]
async fn stage_runner_reports_per_node_outcomes() {
    let executor = ScriptedExecutor::new();
    executor.on("b", "connect", Script::Fail(255, "no route to host".into()));

    let clock = Arc::new(SystemClock);
    let tasks = Arc::new(TaskManager::new(
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(ProgressBroadcaster::new(16)),
        clock.clone(),
        Arc::new(UlidGenerator::new(clock)),
        3,
    ));
    let task_id = tasks.create_task(spec()).await.unwrap().task_id;
    tasks.mark_running(task_id).await.unwrap();

    let runner = StageRunner::new(Arc::clone(&tasks), NodeWorkerPool::new(2), 1024);
    let stage = pipeline(&executor, &[("connect", "connect", STRICT)]).stages()[0].clone();
    let result = runner
        .run_stage(
            task_id,
            &stage,
            &nodes(&["a", "b", "c"]),
            &mut Default::default(),
            StagePosition { index: 0, total: 1 },
            &CancelToken::never(),
        )
        .await
        .unwrap();

    let statuses: Vec<_> = result.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![NodeStatus::Succeeded, NodeStatus::Failed, NodeStatus::Succeeded]
    );
    assert_eq!(result.status, StageStatus::Failed);
    assert_eq!(result.outcomes[1].output.as_deref(), Some("no route to host"));
    assert!(result.summary.unwrap().starts_with("1/3 node(s) failed: b:"));
}

#[tokio::test]
async fn all_stages_succeeding_completes_with_full_progress() {
    let executor = ScriptedExecutor::new();
    let engine = engine(EngineConfig::default());
    let config = PipelineConfig {
        agent_install: "install-agent --os {os} --name {node}".into(),
        ..PipelineConfig::default()
    };
    let pipeline = default_pipeline(&config, executor.clone(), Duration::from_secs(5));

    let task = engine.create_task(spec()).await.unwrap();
    engine
        .start_deployment(task.task_id, nodes(&["a", "b"]), pipeline)
        .await
        .unwrap();
    let done = engine.join(task.task_id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 1.0);
    assert_eq!(done.current_step, "final-validation");
    assert_eq!(done.nodes.succeeded, 2);
    assert!(done.started_at.is_some() && done.ended_at.is_some());

    // The OS fact from the connectivity check reached later templates.
    let installs = executor
        .calls()
        .into_iter()
        .filter(|(_, c)| c.starts_with("install-agent"))
        .map(|(_, c)| c)
        .collect::<Vec<_>>();
    assert_eq!(installs.len(), 2);
    assert!(installs.contains(&"install-agent --os linux --name a".to_string()));

    let events = engine.snapshot(task.task_id).await.unwrap().events;
    let step_starts = events.iter().filter(|e| e.kind == EventKind::StepStart).count();
    assert_eq!(step_starts, 6);
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);
}

#[tokio::test]
async fn subscriber_sees_lifecycle_in_order() {
    let executor = ScriptedExecutor::new();
    let engine = engine(EngineConfig::default());
    let task = engine.create_task(spec()).await.unwrap();
    let subscription = engine.subscribe(task.task_id).await.unwrap();

    let pipeline = pipeline(&executor, &[("one", "first", STRICT), ("two", "second", STRICT)]);
    engine
        .start_deployment(task.task_id, nodes(&["a"]), pipeline)
        .await
        .unwrap();

    let events = drain(subscription).await;
    let lifecycle: Vec<_> = kinds(&events)
        .into_iter()
        .filter(|k| *k != EventKind::StepLog)
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            EventKind::Created,
            EventKind::Start,
            EventKind::StepStart,
            EventKind::StepDone,
            EventKind::StepStart,
            EventKind::StepDone,
            EventKind::Complete,
        ]
    );

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());

    // Per-node logs sit inside their stage.
    assert_eq!(events[3].kind, EventKind::StepLog);
    assert_eq!(events[3].step, "one");
    assert_eq!(events[3].host.as_deref(), Some("a"));
}

#[tokio::test]
async fn progress_never_decreases_while_running() {
    let executor = ScriptedExecutor::new();
    let engine = engine(EngineConfig::default());
    let task = engine.create_task(spec()).await.unwrap();
    let subscription = engine.subscribe(task.task_id).await.unwrap();

    let pipeline = pipeline(
        &executor,
        &[("s1", "a", STRICT), ("s2", "b", STRICT), ("s3", "c", STRICT), ("s4", "d", STRICT)],
    );
    engine
        .start_deployment(task.task_id, nodes(&["n1", "n2"]), pipeline)
        .await
        .unwrap();

    let progress: Vec<f64> = drain(subscription)
        .await
        .into_iter()
        .filter_map(|e| e.progress)
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&1.0));
}

#[tokio::test]
async fn best_effort_drops_failed_nodes_from_later_stages() {
    let executor = ScriptedExecutor::new();
    executor.on("b", "optional", Script::Fail(3, "not supported".into()));
    let engine = engine(EngineConfig::default());

    let task = engine.create_task(spec()).await.unwrap();
    let pipeline = pipeline(
        &executor,
        &[("optional", "optional", BEST_EFFORT), ("required", "required", STRICT)],
    );
    engine
        .start_deployment(task.task_id, nodes(&["a", "b", "c"]), pipeline)
        .await
        .unwrap();
    let done = engine.join(task.task_id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(executor.nodes_that_ran("required"), vec!["a", "c"]);
    assert_eq!(done.nodes.total, 3);
    assert_eq!(done.nodes.failed, 1);
    assert_eq!(done.nodes.succeeded, 2);
}

#[tokio::test]
async fn best_effort_fails_when_no_node_survives() {
    let executor = ScriptedExecutor::new();
    executor.on("*", "optional", Script::Fail(1, String::new()));
    let engine = engine(EngineConfig::default());

    let task = engine.create_task(spec()).await.unwrap();
    let pipeline = pipeline(
        &executor,
        &[("optional", "optional", BEST_EFFORT), ("required", "required", STRICT)],
    );
    engine
        .start_deployment(task.task_id, nodes(&["a", "b"]), pipeline)
        .await
        .unwrap();
    let done = engine.join(task.task_id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert!(executor.nodes_that_ran("required").is_empty());
}

struct PanickingAction;

#[async_trait]
impl NodeAction for PanickingAction {
    async fn run(
        &self,
        node: &Node,
        _facts: &NodeFacts,
        _cancel: &CancelToken,
    ) -> Result<ActionOutput, ExecError> {
        if node.id == "bad" {
            panic!("action bug");
        }
        Ok(ActionOutput::new("fine"))
    }

    fn describe(&self) -> String {
        "panics on node 'bad'".into()
    }
}

#[tokio::test]
async fn panicking_action_fails_only_its_node() {
    let engine = engine(EngineConfig::default());
    let task = engine.create_task(spec()).await.unwrap();
    let pipeline = Pipeline::new(vec![Stage::new("buggy", Arc::new(PanickingAction))]);

    engine
        .start_deployment(task.task_id, nodes(&["good", "bad"]), pipeline)
        .await
        .unwrap();
    let done = engine.join(task.task_id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.nodes.failed, 1);
    assert!(done.error.as_deref().unwrap_or("").contains("bad: node action panicked"));
}

#[tokio::test]
async fn empty_pipeline_completes_immediately() {
    let engine = engine(EngineConfig::default());
    let task = engine.create_task(spec()).await.unwrap();

    engine
        .start_deployment(task.task_id, nodes(&["a"]), Pipeline::default())
        .await
        .unwrap();
    let done = engine.join(task.task_id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 1.0);
}

#[tokio::test]
async fn step_log_output_is_truncated() {
    let executor = ScriptedExecutor::new();
    executor.on("*", "noisy", Script::Ok("x".repeat(100)));
    let engine = engine(EngineConfig {
        output_limit: 10,
        ..EngineConfig::default()
    });

    let task = engine.create_task(spec()).await.unwrap();
    engine
        .start_deployment(
            task.task_id,
            nodes(&["a"]),
            pipeline(&executor, &[("noisy", "noisy", STRICT)]),
        )
        .await
        .unwrap();
    engine.join(task.task_id).await.unwrap();

    let events = engine.snapshot(task.task_id).await.unwrap().events;
    let log = events.iter().find(|e| e.kind == EventKind::StepLog).unwrap();
    let output = log.data.as_ref().unwrap()["output"].as_str().unwrap();
    assert_eq!(output, "xxxxxxxxxx...[truncated 90 bytes]");
    assert_eq!(log.message, "xxxxxxxxxx...[truncated 90 bytes]");
}

#[tokio::test]
async fn step_log_message_carries_output_or_error() {
    let executor = ScriptedExecutor::new();
    executor.on("b", "check", Script::Fail(3, "disk full".into()));
    executor.on("c", "check", Script::Ok(String::new()));
    let engine = engine(EngineConfig::default());

    let task = engine.create_task(spec()).await.unwrap();
    engine
        .start_deployment(
            task.task_id,
            nodes(&["a", "b", "c"]),
            pipeline(&executor, &[("check", "check {node}", BEST_EFFORT)]),
        )
        .await
        .unwrap();
    engine.join(task.task_id).await.unwrap();

    let events = engine.snapshot(task.task_id).await.unwrap().events;
    let message_for = |host: &str| {
        events
            .iter()
            .find(|e| e.kind == EventKind::StepLog && e.host.as_deref() == Some(host))
            .map(|e| e.message.clone())
            .unwrap()
    };
    assert_eq!(message_for("a"), "a ok");
    assert_eq!(message_for("b"), "command exited with status 3");
    assert_eq!(message_for("c"), "ok");
}
