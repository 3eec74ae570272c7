//! Ordered stage lists.

use std::sync::Arc;
use std::time::Duration;

use super::stage::{CommandAction, DetectOsAction, Stage, StagePolicy};
use crate::config::PipelineConfig;
use crate::ports::RemoteExecutor;

pub const CONNECTIVITY_CHECK: &str = "connectivity-check";
pub const AGENT_INSTALL: &str = "agent-install";
pub const AGENT_CONFIGURE: &str = "agent-configure";
pub const WORKLOAD_INSTALL: &str = "workload-install";
pub const SERVICE_START: &str = "service-start";
pub const FINAL_VALIDATION: &str = "final-validation";

/// Stage names of the default deployment pipeline, in order.
pub const DEFAULT_STAGES: [&str; 6] = [
    CONNECTIVITY_CHECK,
    AGENT_INSTALL,
    AGENT_CONFIGURE,
    WORKLOAD_INSTALL,
    SERVICE_START,
    FINAL_VALIDATION,
];

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// One line per stage: `name [policy] description`.
    pub fn describe(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|s| format!("{} [{}] {}", s.name, s.policy, s.action.describe()))
            .collect()
    }
}

/// The standard fleet deployment: connectivity check (with OS detection),
/// then the configured agent and workload commands.
pub fn default_pipeline(
    config: &PipelineConfig,
    executor: Arc<dyn RemoteExecutor>,
    command_timeout: Duration,
) -> Pipeline {
    let policy = |name: &str| {
        if config.best_effort.iter().any(|s| s == name) {
            StagePolicy::BestEffort
        } else {
            StagePolicy::AllMustSucceed
        }
    };
    let command = |name: &str, template: &str| {
        Stage::new(
            name,
            Arc::new(CommandAction::new(Arc::clone(&executor), template, command_timeout)),
        )
        .with_policy(policy(name))
    };

    Pipeline::new(vec![
        Stage::new(
            CONNECTIVITY_CHECK,
            Arc::new(DetectOsAction::new(Arc::clone(&executor), command_timeout)),
        )
        .with_policy(policy(CONNECTIVITY_CHECK)),
        command(AGENT_INSTALL, &config.agent_install),
        command(AGENT_CONFIGURE, &config.agent_configure),
        command(WORKLOAD_INSTALL, &config.workload_install),
        command(SERVICE_START, &config.service_start),
        command(FINAL_VALIDATION, &config.final_validation),
    ])
}
