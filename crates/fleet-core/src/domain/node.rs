//! Nodes (remote hosts) and per-node stage outcomes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A remote host targeted by a deployment.
///
/// Connection parameters are opaque to the orchestrator; only the
/// `RemoteExecutor` implementation interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable node identifier (used in events and counters).
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl Node {
    /// Node whose id is its host name, with default port and user.
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            id: host.clone(),
            host,
            port: default_port(),
            user: default_user(),
            identity_file: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }
}

/// Auxiliary per-node state carried from one stage to the next
/// (e.g. `os` detected during the connectivity check).
pub type NodeFacts = BTreeMap<String, String>;

/// Status of one node within one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    /// Never started (or abandoned) because the run was cancelled.
    Cancelled,
}

/// Result of running one stage on one node. Lives only for the duration of
/// the stage; it is folded into events and counters afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub node_id: String,
    pub stage: String,
    pub status: NodeStatus,
    pub error: Option<String>,
    pub output: Option<String>,
    pub duration: Duration,
    /// Facts learned on this node during the stage.
    pub facts: NodeFacts,
}

impl NodeOutcome {
    pub fn succeeded(node: &Node, stage: &str, output: String, duration: Duration) -> Self {
        Self {
            node_id: node.id.clone(),
            stage: stage.to_string(),
            status: NodeStatus::Succeeded,
            error: None,
            output: Some(output),
            duration,
            facts: NodeFacts::new(),
        }
    }

    pub fn failed(node: &Node, stage: &str, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            node_id: node.id.clone(),
            stage: stage.to_string(),
            status: NodeStatus::Failed,
            error: Some(error.into()),
            output: None,
            duration,
            facts: NodeFacts::new(),
        }
    }

    pub fn cancelled(node: &Node, stage: &str) -> Self {
        Self {
            node_id: node.id.clone(),
            stage: stage.to_string(),
            status: NodeStatus::Cancelled,
            error: Some("cancelled".to_string()),
            output: None,
            duration: Duration::ZERO,
            facts: NodeFacts::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_facts(mut self, facts: NodeFacts) -> Self {
        self.facts = facts;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }
}
