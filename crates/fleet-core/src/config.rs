//! Engine configuration loaded from TOML.
//!
//! ```toml
//! [engine]
//! max_concurrency = 10
//! command_timeout_secs = 600
//! subscriber_buffer = 100
//! output_limit = 4096
//! default_max_retries = 3
//! task_timeout_secs = 3600
//!
//! [ssh]
//! user = "root"
//! port = 22
//! connect_timeout_secs = 10
//! identity_file = "~/.ssh/fleet_ed25519"
//!
//! [pipeline]
//! agent_install = "curl -fsSL https://get.example.com/agent | sh"
//! ```
//!
//! Every section and field is optional; omitted values take the defaults
//! below. Pipeline commands are templates expanded per node: `{node}`,
//! `{host}` and any fact learned by an earlier stage (e.g. `{os}`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::pipeline::DEFAULT_STAGES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub engine: EngineConfig,
    pub ssh: SshConfig,
    pub pipeline: PipelineConfig,
}

/// `[engine]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nodes running a stage concurrently.
    pub max_concurrency: usize,

    /// Per remote command timeout.
    pub command_timeout_secs: u64,

    /// Capacity of each subscriber channel. Events are dropped for a
    /// subscriber whose channel is full.
    pub subscriber_buffer: usize,

    /// Maximum bytes of command output kept in `step-log` events.
    pub output_limit: usize,

    /// `max_retries` for tasks that don't set their own.
    pub default_max_retries: u32,

    /// Deadline for a whole deployment run. `None` disables it.
    pub task_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            command_timeout_secs: 600,
            subscriber_buffer: 100,
            output_limit: 4096,
            default_max_retries: 3,
            task_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// `[ssh]` section: defaults applied to nodes given only by host name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub identity_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            connect_timeout_secs: 10,
            identity_file: None,
        }
    }
}

/// `[pipeline]` section: command templates for the default deployment
/// stages. The connectivity check is built in.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub agent_install: String,
    pub agent_configure: String,
    pub workload_install: String,
    pub service_start: String,
    pub final_validation: String,

    /// Stages listed here run best-effort instead of all-must-succeed.
    pub best_effort: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agent_install: "test -x /usr/local/bin/fleet-agent".to_string(),
            agent_configure: "test -f /etc/fleet-agent/config.yaml".to_string(),
            workload_install: "command -v containerd".to_string(),
            service_start: "systemctl is-active --quiet fleet-agent".to_string(),
            final_validation: "fleet-agent health".to_string(),
            best_effort: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "[engine].max_concurrency must be >= 1 (got 0)".to_string(),
            ));
        }
        if self.engine.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "[engine].subscriber_buffer must be >= 1 (got 0)".to_string(),
            ));
        }
        if self.engine.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "[engine].command_timeout_secs must be >= 1 (got 0)".to_string(),
            ));
        }
        if self.engine.task_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "[engine].task_timeout_secs must be >= 1 when set".to_string(),
            ));
        }
        if let Some(unknown) = self
            .pipeline
            .best_effort
            .iter()
            .find(|name| !DEFAULT_STAGES.contains(&name.as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "[pipeline].best_effort names unknown stage '{unknown}' (known: {})",
                DEFAULT_STAGES.join(", ")
            )));
        }
        Ok(())
    }
}
