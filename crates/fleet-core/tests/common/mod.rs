//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::app::{
    CommandAction, Engine, EngineBuilder, Pipeline, Stage, StagePolicy, Subscription,
};
use fleet_core::cancel::CancelToken;
use fleet_core::config::EngineConfig;
use fleet_core::domain::{EventKind, ExecError, Node, TaskEvent, TaskId, TaskRecord, TaskStatus};
use fleet_core::impls::InMemoryTaskStore;
use fleet_core::ports::RemoteExecutor;

/// What the fake executor does for a matching command.
#[derive(Debug, Clone)]
pub enum Script {
    Ok(String),
    Fail(i32, String),
    /// Succeed after a delay (cancellable).
    Sleep(Duration),
    /// Block until the run is cancelled.
    Hang,
}

struct Rule {
    node: String,
    command: String,
    script: Script,
}

/// A fake executor that:
/// - records every `(node id, command)` it was asked to run
/// - answers from scripted rules (first match wins; `*` matches any node)
/// - otherwise succeeds, answering `uname -s` with `Linux`.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, node: &str, command_contains: &str, script: Script) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            node: node.to_string(),
            command: command_contains.to_string(),
            script,
        });
        self
    }

    pub fn clear_rules(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Node ids that ran a command containing `needle`, sorted.
    pub fn nodes_that_ran(&self, needle: &str) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .calls()
            .into_iter()
            .filter(|(_, command)| command.contains(needle))
            .map(|(node, _)| node)
            .collect();
        nodes.sort();
        nodes
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script_for(&self, node: &Node, command: &str) -> Script {
        let rules = self.rules.lock().unwrap();
        rules
            .iter()
            .find(|r| (r.node == "*" || r.node == node.id) && command.contains(&r.command))
            .map(|r| r.script.clone())
            .unwrap_or_else(|| {
                if command == "uname -s" {
                    Script::Ok("Linux\n".to_string())
                } else {
                    Script::Ok(format!("{} ok\n", node.id))
                }
            })
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        node: &Node,
        command: &str,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((node.id.clone(), command.to_string()));
        let script = self.script_for(node, command);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = match script {
            Script::Ok(output) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(output)
            }
            Script::Fail(code, output) => Err(ExecError::NonZeroExit { code, output }),
            Script::Sleep(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(format!("{} ok\n", node.id)),
                _ = cancel.cancelled() => Err(ExecError::Cancelled { output: String::new() }),
            },
            Script::Hang => {
                cancel.cancelled().await;
                Err(ExecError::Cancelled {
                    output: "partial\n".to_string(),
                })
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn engine(config: EngineConfig) -> Engine {
    EngineBuilder::new(config)
        .store(Arc::new(InMemoryTaskStore::new()))
        .build()
        .unwrap()
}

pub fn nodes(ids: &[&str]) -> Vec<Node> {
    ids.iter().map(|id| Node::new(*id)).collect()
}

/// A pipeline of command stages: `(stage name, command, policy)`.
pub fn pipeline(executor: &Arc<ScriptedExecutor>, stages: &[(&str, &str, StagePolicy)]) -> Pipeline {
    let executor: Arc<dyn RemoteExecutor> = executor.clone();
    Pipeline::new(
        stages
            .iter()
            .map(|(name, command, policy)| {
                Stage::new(
                    *name,
                    Arc::new(CommandAction::new(
                        Arc::clone(&executor),
                        *command,
                        Duration::from_secs(5),
                    )),
                )
                .with_policy(*policy)
            })
            .collect(),
    )
}

pub fn kinds(events: &[TaskEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// Collect a subscription, failing the test if it doesn't end in time.
pub async fn drain(subscription: Subscription) -> Vec<TaskEvent> {
    tokio::time::timeout(Duration::from_secs(10), subscription.collect())
        .await
        .expect("subscription did not end")
}

/// Poll until the task reaches `status`.
pub async fn wait_for_status(engine: &Engine, task_id: TaskId, status: TaskStatus) -> TaskRecord {
    for _ in 0..500 {
        let task = engine.get_task(task_id).await.unwrap();
        if task.status == status {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status}");
}

/// Poll until the executor has seen at least `n` calls.
pub async fn wait_for_calls(executor: &ScriptedExecutor, n: usize) {
    for _ in 0..500 {
        if executor.calls().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("executor never reached {n} calls");
}
