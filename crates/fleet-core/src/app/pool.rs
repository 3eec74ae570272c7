//! NodeWorkerPool - ノード集合への上限付きファンアウト
//!
//! ノードごとに tokio タスクを 1 つ起動し、permit を持つ
//! `max_concurrency` 個だけが同時にアクションを実行します。
//!
//! # 学習ポイント
//! - Semaphore + JoinSet による同時実行数の制限
//! - 内側の `tokio::spawn` で panic を JoinError として受け取り、失敗結果に変換
//! - 結果は完了順に取り出し、最後に入力順へ並べ直す

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::domain::{Node, NodeOutcome};

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct NodeWorkerPool {
    max_concurrency: usize,
}

impl Default for NodeWorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl NodeWorkerPool {
    /// `max_concurrency` is clamped to at least 1.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Start `action` on every node and return a handle that yields outcomes
    /// as they complete.
    ///
    /// - A panicking action becomes a `failed` outcome for its node.
    /// - Once `cancel` fires, nodes still waiting for a permit get a
    ///   `cancelled` outcome without running; running actions get the token
    ///   and are expected to stop at their next await.
    pub fn spawn_over_nodes<F, Fut>(
        &self,
        stage: &str,
        nodes: &[Node],
        cancel: &CancelToken,
        action: F,
    ) -> PoolRun
    where
        F: Fn(Node, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeOutcome> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let action = Arc::new(action);
        let mut set = JoinSet::new();

        for (index, node) in nodes.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let action = Arc::clone(&action);
            let cancel = cancel.clone();
            let stage = stage.to_string();

            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (index, NodeOutcome::cancelled(&node, &stage));
                };
                if cancel.is_cancelled() {
                    return (index, NodeOutcome::cancelled(&node, &stage));
                }

                // Run the action on its own task so a panic stays contained.
                let started = Instant::now();
                let outcome = match tokio::spawn(action(node.clone(), cancel)).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        let message = panic_message(&err);
                        warn!(node = %node.id, stage = %stage, error = %message, "node action aborted");
                        NodeOutcome::failed(&node, &stage, message, started.elapsed())
                    }
                };
                (index, outcome)
            });
        }

        PoolRun {
            set,
            stage: stage.to_string(),
            nodes: nodes.to_vec(),
            slots: vec![None; nodes.len()],
        }
    }

    /// Run `action` on every node and wait for all of them. Outcomes are in
    /// input order.
    pub async fn run_over_nodes<F, Fut>(
        &self,
        stage: &str,
        nodes: &[Node],
        cancel: &CancelToken,
        action: F,
    ) -> Vec<NodeOutcome>
    where
        F: Fn(Node, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeOutcome> + Send + 'static,
    {
        self.spawn_over_nodes(stage, nodes, cancel, action)
            .finish()
            .await
    }
}

/// In-flight fan-out started by `NodeWorkerPool::spawn_over_nodes`.
pub struct PoolRun {
    set: JoinSet<(usize, NodeOutcome)>,
    stage: String,
    nodes: Vec<Node>,
    slots: Vec<Option<NodeOutcome>>,
}

impl PoolRun {
    /// Next completed node as `(input index, outcome)`, or `None` when every
    /// node has finished.
    pub async fn next(&mut self) -> Option<(usize, NodeOutcome)> {
        loop {
            match self.set.join_next().await? {
                Ok((index, outcome)) => {
                    self.slots[index] = Some(outcome.clone());
                    return Some((index, outcome));
                }
                Err(err) => {
                    // The per-node wrapper itself died; its slot is filled in `finish`.
                    warn!(stage = %self.stage, error = %err, "node worker lost");
                }
            }
        }
    }

    /// Wait for the remaining nodes and return every outcome in input order.
    pub async fn finish(mut self) -> Vec<NodeOutcome> {
        while self.next().await.is_some() {}
        let stage = self.stage;
        self.slots
            .into_iter()
            .zip(&self.nodes)
            .map(|(slot, node)| {
                slot.unwrap_or_else(|| {
                    NodeOutcome::failed(node, &stage, "node worker lost", Default::default())
                })
            })
            .collect()
    }
}

fn panic_message(err: &JoinError) -> String {
    if !err.is_panic() {
        return "node action aborted".to_string();
    }
    // `JoinError` only hands out the payload by value; Display carries it.
    format!("node action panicked: {err}")
}
