//! `fleet deploy`: build the engine, run one deployment, stream its events.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fleet_core::app::{Engine, EngineBuilder, default_pipeline};
use fleet_core::config::{FleetConfig, SshConfig};
use fleet_core::domain::{EngineError, Node, TaskId, TaskSpec, TaskStatus};
use fleet_core::impls::{InMemoryTaskStore, SshExecutor};
use serde_json::json;
use tracing::{info, warn};

use crate::cli::DeployArgs;

pub const OP_TYPE: &str = "deploy";

/// Returns the final task status (or `Completed` for a dry run).
pub async fn run(args: DeployArgs) -> Result<TaskStatus> {
    // (A) 設定とターゲットの解決
    let config = match &args.config {
        Some(path) => FleetConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FleetConfig::default(),
    };

    let nodes = args
        .hosts
        .iter()
        .map(|target| parse_target(target, &config.ssh))
        .collect::<Result<Vec<_>>>()?;

    // (B) SSH 実行器とデフォルトパイプライン
    let executor = Arc::new(SshExecutor::new(&config.ssh));
    let pipeline = default_pipeline(&config.pipeline, executor, config.engine.command_timeout());

    if args.dry_run {
        println!("max_concurrency: {}", config.engine.max_concurrency);
        println!("command_timeout: {}s", config.engine.command_timeout_secs);
        println!("nodes:");
        for node in &nodes {
            println!("  {} ({}@{}:{})", node.id, node.user, node.host, node.port);
        }
        println!("pipeline:");
        for line in pipeline.describe() {
            println!("  {line}");
        }
        return Ok(TaskStatus::Completed);
    }

    // (C) Engine を組み立て（ストアはインメモリ）
    let engine = EngineBuilder::new(config.engine.clone())
        .store(Arc::new(InMemoryTaskStore::new()))
        .build()
        .context("building engine")?;

    let mut spec = TaskSpec::new(&args.name, OP_TYPE, &args.actor)
        .with_nodes(nodes.iter().map(|n| n.id.clone()))
        .with_params(json!({ "hosts": args.hosts, "stages": pipeline.names() }));
    if let Some(cluster) = &args.cluster {
        spec = spec.with_cluster(cluster);
    }

    // (D) タスク作成 -> 購読 -> 開始。購読を先にしてイベントを取りこぼさない
    let task = engine.create_task(spec).await?;
    let task_id = task.task_id;
    let mut events = engine.subscribe(task_id).await?;
    engine.start_deployment(task_id, nodes, pipeline).await?;

    // (E) イベントを JSON 行で出力。Ctrl-C でキャンセル要求
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event.to_payload())?),
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(err) = signal {
                    warn!(error = %err, "listening for ctrl-c failed");
                    continue;
                }
                info!(task_id = %task_id, "interrupt received; cancelling deployment");
                request_cancel(&engine, task_id).await?;
            }
        }
    }

    let record = engine.join(task_id).await?;
    info!(
        task_id = %task_id,
        status = %record.status,
        nodes_total = record.nodes.total,
        nodes_succeeded = record.nodes.succeeded,
        nodes_failed = record.nodes.failed,
        "deployment finished"
    );
    Ok(record.status)
}

/// Cancel on operator interrupt. A task that finished in the meantime is
/// left as it is.
async fn request_cancel(engine: &Engine, task_id: TaskId) -> Result<()> {
    match engine.cancel_task(task_id, "interrupted by operator").await {
        Ok(()) => Ok(()),
        Err(EngineError::NotCancellable { status, .. }) => {
            info!(task_id = %task_id, %status, "task already finished; nothing to cancel");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// `host`, `user@host` or `user@host:port`; missing parts come from `[ssh]`.
fn parse_target(target: &str, ssh: &SshConfig) -> Result<Node> {
    let target = target.trim();
    let (user, rest) = match target.split_once('@') {
        Some((user, rest)) => (user, rest),
        None => (ssh.user.as_str(), target),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in target '{target}'"))?;
            (host, port)
        }
        None => (rest, ssh.port),
    };
    if host.is_empty() || user.is_empty() {
        bail!("invalid target '{target}'");
    }

    let mut node = Node::new(host).with_user(user).with_port(port);
    if let Some(identity) = &ssh.identity_file {
        node = node.with_identity_file(identity.clone());
    }
    Ok(node)
}
