//! `RemoteExecutor` over the system OpenSSH client.
//!
//! Every call spawns a fresh `ssh` process (no connection reuse). The
//! client runs non-interactively (`BatchMode=yes`), so a host that wants a
//! password fails fast with exit status 255 instead of hanging.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::cancel::{CancelReason, CancelToken};
use crate::config::SshConfig;
use crate::domain::{ExecError, Node};
use crate::ports::RemoteExecutor;

/// Exit status the OpenSSH client reserves for its own errors.
const SSH_CLIENT_ERROR: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Use another client binary (a wrapper script, a pinned path).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn build_args(&self, node: &Node, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            node.port.to_string(),
        ];
        if let Some(identity) = &node.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", node.user, node.host));
        args.push(command.to_string());
        args
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled(CancelReason),
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        node: &Node,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<String, ExecError> {
        debug!(node = %node.id, host = %node.host, command, "running remote command");

        let mut child = Command::new(&self.program)
            .args(self.build_args(node, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Connect {
                host: node.host.clone(),
                message: format!("spawning {}: {e}", self.program),
            })?;

        // stdout and stderr land in one buffer in arrival order (line granularity).
        let buffer = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_lines(stdout, Arc::clone(&buffer))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_lines(stderr, Arc::clone(&buffer))));
        }

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            reason = cancel.cancelled() => Waited::Cancelled(reason),
        };

        match waited {
            Waited::Exited(status) => {
                for reader in readers {
                    let _ = reader.await;
                }
                let output = snapshot(&buffer);
                let status = status.map_err(|e| ExecError::Connect {
                    host: node.host.clone(),
                    message: format!("waiting for ssh: {e}"),
                })?;
                match status.code() {
                    Some(0) => Ok(output),
                    Some(SSH_CLIENT_ERROR) => Err(ExecError::Connect {
                        host: node.host.clone(),
                        message: last_line(&output)
                            .unwrap_or("ssh exited with status 255")
                            .to_string(),
                    }),
                    Some(code) => Err(ExecError::NonZeroExit { code, output }),
                    // Killed by a signal.
                    None => Err(ExecError::NonZeroExit { code: -1, output }),
                }
            }
            Waited::TimedOut => {
                warn!(node = %node.id, timeout_secs = timeout.as_secs(), "remote command timed out; killing");
                kill(&mut child, node).await;
                Err(ExecError::Timeout {
                    timeout_secs: timeout.as_secs(),
                    output: snapshot(&buffer),
                })
            }
            Waited::Cancelled(reason) => {
                debug!(node = %node.id, %reason, "remote command cancelled; killing");
                kill(&mut child, node).await;
                Err(ExecError::Cancelled {
                    output: snapshot(&buffer),
                })
            }
        }
    }
}

async fn collect_lines<R>(reader: R, buffer: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buf.push_str(&line);
        buf.push('\n');
    }
}

fn snapshot(buffer: &Mutex<String>) -> String {
    buffer.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

async fn kill(child: &mut Child, node: &Node) {
    if let Err(e) = child.kill().await {
        warn!(node = %node.id, error = %e, "failed to kill ssh process");
    }
}
