//! RemoteExecutor port - 1 ホストで 1 コマンドを実行
//!
//! # 実装
//! - **SshExecutor**（本番用）
//! - テストではスクリプト化したフェイクを使用

use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::domain::{ExecError, Node};

/// Opens a fresh remote-shell session per call and runs a single command.
///
/// Implementations are pure transport:
/// - stdout and stderr are collected into one buffer in arrival order;
/// - a command exceeding `timeout` is killed and `ExecError::Timeout`
///   carries whatever output was captured;
/// - no retries and no interpretation of exit codes beyond
///   `ExecError::NonZeroExit`.
///
/// `cancel` is observed while the command is in flight; a fired token kills
/// the command and yields `ExecError::Cancelled`.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String, ExecError>;
}
